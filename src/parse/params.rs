//! Bind-parameter scanner
//!
//! Parses the comma-separated list trailing a `parameters: ` detail, e.g.
//!
//! ```text
//! $1 = '', $2 = '30', $3 = NULL, $4 = 'it''s quoted'
//! ```
//!
//! into `["", "30", NULL, "it's quoted"]`. Values are either `NULL` or
//! single-quoted strings in which `''` encodes a literal quote. The `$N`
//! labels are positional decoration and are not validated against the
//! value's position.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::ParseError;

#[allow(clippy::expect_used)]
static PARAMETER_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(, )?\$\d+ = ").expect("parameter prefix pattern"));

/// Parse a bind-parameter list. Empty input yields an empty list; each
/// `NULL` becomes `None` and each quoted value a string with `''`
/// unescaped.
pub fn parse_bind_parameters(input: &str) -> Result<Vec<Option<String>>, ParseError> {
    let mut parameters = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let prefix = PARAMETER_PREFIX
            .find(rest)
            .ok_or_else(|| ParseError::Parameter(rest.to_string()))?;
        rest = &rest[prefix.end()..];

        if let Some(tail) = rest.strip_prefix("NULL") {
            parameters.push(None);
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('\'') {
            let closing = find_closing_quote(tail)
                .ok_or_else(|| ParseError::UnterminatedParameter(input.to_string()))?;
            parameters.push(Some(tail[..closing].replace("''", "'")));
            rest = &tail[closing + 1..];
        } else {
            return Err(ParseError::Parameter(rest.to_string()));
        }
    }

    Ok(parameters)
}

/// Index of the closing quote in `input`, skipping `''` escape pairs.
fn find_closing_quote(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\'' {
            if bytes.get(idx + 1) == Some(&b'\'') {
                idx += 2;
                continue;
            }
            return Some(idx);
        }
        idx += 1;
    }
    None
}
