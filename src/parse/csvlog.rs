//! Parser for csvlog-format PostgreSQL logs
//!
//! `log_destination = 'csvlog'` writes fixed-position CSV records, and the
//! interesting difference from the stderr format is that an execute's bind
//! parameters arrive in the *same* record (the detail field) rather than on
//! a following line. Every execute therefore binds immediately and the
//! pending-execute slot is unnecessary here. Multi-line queries are just
//! quoted CSV fields, handled by the CSV decoder.

use csv::{ReaderBuilder, StringRecord};
use regex::Regex;
use std::io::Read;
use std::sync::LazyLock;

use crate::error::ParseError;
use crate::item::{Details, Execute, Item, SessionId};

use super::params::parse_bind_parameters;
use super::{parse_log_timestamp, spawn_parser, ParserHandle};

// Fixed csvlog field positions (PostgreSQL 12+ layout).
const TIMESTAMP_FIELD: usize = 0;
const USER_FIELD: usize = 1;
const DATABASE_FIELD: usize = 2;
const SESSION_FIELD: usize = 5;
const SEVERITY_FIELD: usize = 11;
const MESSAGE_FIELD: usize = 13;
const DETAIL_FIELD: usize = 14;
const MIN_FIELDS: usize = 15;

const STATEMENT_MARKER: &str = "statement: ";
const UNNAMED_EXECUTE_MARKER: &str = "execute <unnamed>: ";
const PARAMETERS_PREFIX: &str = "parameters: ";

#[allow(clippy::expect_used)]
static BARE_DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^duration: \d+\.\d+ ms$").expect("duration pattern"));

#[allow(clippy::expect_used)]
static NAMED_EXECUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"execute \w+: ").expect("named execute pattern"));

/// Parse a csvlog file, producing items down the returned handle.
pub fn parse_csvlog<R>(input: R) -> ParserHandle
where
    R: Read + Send + 'static,
{
    spawn_parser(move |sink| {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input);

        for record in reader.records() {
            let keep_going = match record {
                Ok(record) => sink.emit(parse_record(&record)),
                Err(err) => {
                    sink.report(err.into());
                    true
                }
            };
            if !keep_going {
                break;
            }
        }

        Ok(())
    })
}

fn parse_record(record: &StringRecord) -> Result<Option<Item>, ParseError> {
    if record.len() < MIN_FIELDS {
        return Err(ParseError::ShortRecord {
            expected: MIN_FIELDS,
            got: record.len(),
        });
    }

    let field = |idx: usize| record.get(idx).unwrap_or_default();
    let session = field(SESSION_FIELD);
    if session.is_empty() {
        return Err(ParseError::MalformedLine(format!("{record:?}")));
    }

    let details = Details {
        timestamp: parse_log_timestamp(field(TIMESTAMP_FIELD))?,
        session_id: SessionId::from(session),
        user: field(USER_FIELD).to_string(),
        database: field(DATABASE_FIELD).to_string(),
    };

    dispatch(
        details,
        field(SEVERITY_FIELD),
        field(MESSAGE_FIELD),
        field(DETAIL_FIELD),
    )
}

fn dispatch(
    details: Details,
    severity: &str,
    message: &str,
    detail: &str,
) -> Result<Option<Item>, ParseError> {
    // duration: 0.029 ms
    // A lone duration never completes anything here: executes bind from
    // their own record's detail field.
    if BARE_DURATION.is_match(message) {
        return Ok(None);
    }

    // exec_simple_query, statement: SELECT 1
    // Statements may be preceded by internal context, so match the marker
    // anywhere on the first message line.
    if let Some(query) = tail_after_marker(message, STATEMENT_MARKER) {
        return Ok(Some(Item::Statement {
            details,
            query: query.to_string(),
        }));
    }

    // duration: 0.029 ms  execute <unnamed>: SELECT 1 FROM t WHERE x=$1
    if let Some(query) = tail_after_marker(message, UNNAMED_EXECUTE_MARKER) {
        return Ok(Some(bind_from_detail(details, query, detail)?));
    }

    // duration: 0.029 ms  execute fetch_account: SELECT ...
    if let Some(query) = tail_after_named_execute(message) {
        return Ok(Some(bind_from_detail(details, query, detail)?));
    }

    // A parameters detail in the message position has no execute to bind
    // to in this format; report it the same way the stderr parser does.
    if message.starts_with(PARAMETERS_PREFIX) {
        return Err(ParseError::UnmatchedParameters(message.to_string()));
    }

    if message.starts_with("connection authorized: ") {
        return Ok(Some(Item::Connect(details)));
    }

    if message.starts_with("disconnection: ") {
        return Ok(Some(Item::Disconnect(details)));
    }

    if message.starts_with("connection received: ")
        || severity == "ERROR"
        || severity == "DETAIL"
    {
        return Ok(None);
    }

    Err(ParseError::UnrecognisedMessage(message.to_string()))
}

/// Complete an execute with the parameters carried in the record's detail
/// field; an absent detail means the query takes no parameters.
fn bind_from_detail(
    details: Details,
    query: &str,
    detail: &str,
) -> Result<Item, ParseError> {
    let raw = detail.strip_prefix(PARAMETERS_PREFIX).unwrap_or(detail);
    let parameters = parse_bind_parameters(raw)?;
    Ok(Execute {
        details,
        query: query.to_string(),
    }
    .bind(parameters))
}

/// The message tail after the last occurrence of `marker` on the first
/// message line, if any. Markers never span the quoted multi-line part of
/// a query, so the search stops at the first newline.
fn tail_after_marker<'m>(message: &'m str, marker: &str) -> Option<&'m str> {
    let first_line = &message[..message.find('\n').unwrap_or(message.len())];
    let idx = first_line.rfind(marker)?;
    Some(&message[idx + marker.len()..])
}

/// As [`tail_after_marker`] for `execute <name>: `, dropping the prepare
/// name from the returned query.
fn tail_after_named_execute(message: &str) -> Option<&str> {
    let first_line = &message[..message.find('\n').unwrap_or(message.len())];
    let last = NAMED_EXECUTE.find_iter(first_line).last()?;
    Some(&message[last.end()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(input: &str) -> Vec<StringRecord> {
        ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input.as_bytes())
            .records()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    fn parse_one(input: &str) -> Result<Option<Item>, ParseError> {
        let all = records(input);
        assert_eq!(all.len(), 1, "expected exactly one CSV record");
        parse_record(&all[0])
    }

    fn csv_line(severity: &str, message: &str, detail: &str) -> String {
        format!(
            "2023-06-09 01:50:01.825 UTC,postgres,postgres,12345,127.0.0.1:51529,64828549.7698,1,SELECT,2023-06-09 01:00:00 UTC,3/0,0,{severity},00000,\"{message}\",\"{detail}\",,,,,,,,",
            severity = severity,
            message = message.replace('"', "\"\""),
            detail = detail.replace('"', "\"\""),
        )
    }

    #[test]
    fn execute_binds_inline_parameters() {
        let line = csv_line(
            "LOG",
            "duration: 0.029 ms  execute <unnamed>: SELECT 1 FROM t WHERE x=$1 AND y=$2 LIMIT $3",
            "parameters: $1 = '1072', $2 = 'f', $3 = '1'",
        );
        let item = parse_one(&line).unwrap().unwrap();

        match item {
            Item::BoundExecute {
                query, parameters, ..
            } => {
                assert_eq!(query, "SELECT 1 FROM t WHERE x=$1 AND y=$2 LIMIT $3");
                assert_eq!(
                    parameters,
                    vec![
                        Some("1072".to_string()),
                        Some("f".to_string()),
                        Some("1".to_string()),
                    ]
                );
            }
            other => panic!("expected BoundExecute, got {}", other.kind()),
        }
    }

    #[test]
    fn execute_without_detail_binds_empty() {
        let line = csv_line("LOG", "duration: 0.010 ms  execute <unnamed>: select t.oid", "");
        let item = parse_one(&line).unwrap().unwrap();

        match item {
            Item::BoundExecute { parameters, .. } => assert!(parameters.is_empty()),
            other => panic!("expected BoundExecute, got {}", other.kind()),
        }
    }

    #[test]
    fn named_execute_drops_prepare_name() {
        let line = csv_line(
            "LOG",
            "duration: 0.029 ms  execute fetch_account: SELECT * FROM accounts WHERE id = $1",
            "parameters: $1 = '42'",
        );
        let item = parse_one(&line).unwrap().unwrap();

        match item {
            Item::BoundExecute { query, .. } => {
                assert_eq!(query, "SELECT * FROM accounts WHERE id = $1");
            }
            other => panic!("expected BoundExecute, got {}", other.kind()),
        }
    }

    #[test]
    fn statement_with_leading_context() {
        let line = csv_line("LOG", "statement: SELECT version()", "");
        match parse_one(&line).unwrap().unwrap() {
            Item::Statement { query, .. } => assert_eq!(query, "SELECT version()"),
            other => panic!("expected Statement, got {}", other.kind()),
        }
    }

    #[test]
    fn multi_line_statement_in_quoted_field() {
        let line = csv_line("LOG", "statement: DELETE FROM que_jobs\nWHERE queue = $1::text", "");
        match parse_one(&line).unwrap().unwrap() {
            Item::Statement { query, .. } => {
                assert_eq!(query, "DELETE FROM que_jobs\nWHERE queue = $1::text");
            }
            other => panic!("expected Statement, got {}", other.kind()),
        }
    }

    #[test]
    fn bare_duration_is_ignored() {
        let line = csv_line("LOG", "duration: 0.029 ms", "");
        assert_eq!(parse_one(&line).unwrap(), None);
    }

    #[test]
    fn connection_lifecycle_records() {
        let connect = csv_line("LOG", "connection authorized: user=postgres database=postgres", "");
        assert!(matches!(parse_one(&connect).unwrap().unwrap(), Item::Connect(_)));

        let disconnect = csv_line(
            "LOG",
            "disconnection: session time: 0:00:03.861 user=postgres database=postgres host=[local]",
            "",
        );
        assert!(matches!(parse_one(&disconnect).unwrap().unwrap(), Item::Disconnect(_)));

        let received = csv_line("LOG", "connection received: host=127.0.0.1 port=59103", "");
        assert_eq!(parse_one(&received).unwrap(), None);
    }

    #[test]
    fn error_severity_is_discarded() {
        let line = csv_line("ERROR", "relation \"missing\" does not exist", "");
        assert_eq!(parse_one(&line).unwrap(), None);
    }

    #[test]
    fn stray_parameters_message_is_a_diagnostic() {
        let line = csv_line("DETAIL", "parameters: $1 = '1'", "");
        assert!(matches!(
            parse_one(&line),
            Err(ParseError::UnmatchedParameters(_))
        ));
    }

    #[test]
    fn short_record_is_a_diagnostic() {
        let all = records("2023-06-09 01:50:01.825 UTC,postgres,postgres");
        assert!(matches!(
            parse_record(&all[0]),
            Err(ParseError::ShortRecord { .. })
        ));
    }

    #[tokio::test]
    async fn driver_streams_items() {
        let input = format!(
            "{}\n{}\n",
            csv_line("LOG", "connection authorized: user=postgres database=postgres", ""),
            csv_line(
                "LOG",
                "duration: 0.029 ms  execute <unnamed>: SELECT 1 FROM t WHERE x=$1",
                "parameters: $1 = '1072'",
            ),
        );
        let mut handle = parse_csvlog(std::io::Cursor::new(input));

        let mut items = Vec::new();
        while let Some(item) = handle.items.recv().await {
            items.push(item);
        }

        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Item::Connect(_)));
        assert!(matches!(items[1], Item::BoundExecute { .. }));
        assert!(handle.done.await.unwrap().is_ok());
    }
}
