//! Parser for stderr-format PostgreSQL logs
//!
//! Expects `log_line_prefix = '%m|%u|%d|%c|'`, so every logical record
//! splits into timestamp, user, database, session id and message. Simple
//! queries arrive complete on a single `statement:` line; extended-protocol
//! queries arrive as an `execute` line whose parameters only show up on a
//! following `parameters:` DETAIL (or are confirmed absent by a bare
//! `duration:` line), which is what the per-session pending slot is for.

use regex::Regex;
use std::collections::HashMap;
use std::io::Read;
use std::sync::LazyLock;

use crate::error::ParseError;
use crate::item::{Details, Execute, Item, SessionId};

use super::params::parse_bind_parameters;
use super::scanner::LogScanner;
use super::{parse_log_timestamp, spawn_parser, ParserHandle};

const DURATION_PREFIX: &str = "LOG:  duration: ";
const STATEMENT_PREFIX: &str = "LOG:  statement: ";
const UNNAMED_EXECUTE_PREFIX: &str = "LOG:  execute <unnamed>: ";
const NAMED_EXECUTE_PREFIX: &str = "LOG:  execute ";
const PARAMETERS_PREFIX: &str = "DETAIL:  parameters: ";
const CONNECTION_AUTHORIZED_PREFIX: &str = "LOG:  connection authorized: ";
const DISCONNECTION_PREFIX: &str = "LOG:  disconnection: ";
const CONNECTION_RECEIVED_PREFIX: &str = "LOG:  connection received: ";

// A duration message with nothing after it. Lines like
// `duration: 0.096 ms  parse <unnamed>: ...` must not match: they carry a
// parse/bind context, not the completion of an execute.
#[allow(clippy::expect_used)]
static BARE_DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+ ms$").expect("duration pattern"));

/// Parse a stderr-format log, producing items down the returned handle.
pub fn parse_errlog<R>(input: R) -> ParserHandle
where
    R: Read + Send + 'static,
{
    spawn_parser(move |sink| {
        let mut scanner = LogScanner::new(input);
        let mut parser = ErrlogParser::new();

        while let Some(record) = scanner.scan()? {
            if !sink.emit(parser.parse_line(&record)) {
                break;
            }
        }

        // Executes still pending here never saw their parameters; without
        // a terminating DETAIL or duration they cannot be replayed.
        Ok(())
    })
}

/// Stateful line parser for the stderr format.
pub struct ErrlogParser {
    pending: HashMap<SessionId, Execute>,
}

impl ErrlogParser {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Parse one logical record into at most one item.
    pub fn parse_line(&mut self, line: &str) -> Result<Option<Item>, ParseError> {
        let tokens: Vec<&str> = line.splitn(5, '|').collect();
        if tokens.len() != 5 {
            return Err(ParseError::MalformedLine(line.to_string()));
        }
        let (timestamp, user, database, session, message) =
            (tokens[0], tokens[1], tokens[2], tokens[3], tokens[4]);

        if session.is_empty() {
            return Err(ParseError::MalformedLine(line.to_string()));
        }

        let details = Details {
            timestamp: parse_log_timestamp(timestamp)?,
            session_id: SessionId::from(session),
            user: user.to_string(),
            database: database.to_string(),
        };

        self.dispatch(details, message)
    }

    fn dispatch(&mut self, details: Details, message: &str) -> Result<Option<Item>, ParseError> {
        // LOG:  duration: 0.326 ms
        // A bare duration marks completion of the preceding execute and
        // confirms it ran without parameters. Durations for other steps
        // (parse, bind) carry trailing context and fall through.
        if let Some(rest) = message.strip_prefix(DURATION_PREFIX) {
            if BARE_DURATION.is_match(rest) {
                return Ok(self
                    .pending
                    .remove(&details.session_id)
                    .map(|execute| execute.bind(Vec::new())));
            }
        }

        // LOG:  statement: select pg_reload_conf();
        if let Some(query) = message.strip_prefix(STATEMENT_PREFIX) {
            return Ok(Some(Item::Statement {
                details,
                query: query.to_string(),
            }));
        }

        // LOG:  execute <unnamed>: select pg_sleep($1)
        // The extended protocol sends even argument-less queries as an
        // unnamed prepared statement, so nothing is emitted until a
        // following DETAIL or duration confirms execution.
        if let Some(query) = message.strip_prefix(UNNAMED_EXECUTE_PREFIX) {
            self.pending.insert(
                details.session_id.clone(),
                Execute {
                    details,
                    query: query.to_string(),
                },
            );
            return Ok(None);
        }

        // LOG:  execute fetch_account: select * from accounts where id = $1
        // Named prepares are replayed as ad-hoc parameterized executes
        // rather than genuine prepare/execute pairs; the name is dropped
        // and the query keeps its leading space.
        if let Some(rest) = message.strip_prefix(NAMED_EXECUTE_PREFIX) {
            if let Some((name, query)) = rest.split_once(':') {
                if is_prepare_name(name) && query.starts_with(' ') {
                    self.pending.insert(
                        details.session_id.clone(),
                        Execute {
                            details,
                            query: query.to_string(),
                        },
                    );
                    return Ok(None);
                }
            }
        }

        // DETAIL:  parameters: $1 = '1', $2 = NULL
        if let Some(raw) = message.strip_prefix(PARAMETERS_PREFIX) {
            return match self.pending.remove(&details.session_id) {
                Some(execute) => Ok(Some(execute.bind(parse_bind_parameters(raw)?))),
                // Under log_min_duration_statement = 0 the bind step logs
                // the same DETAIL ahead of the execute line, so this is
                // routinely hit; surfaced as a diagnostic, not a stop.
                None => Err(ParseError::UnmatchedParameters(message.to_string())),
            };
        }

        // LOG:  connection authorized: user=postgres database=postgres
        if message.starts_with(CONNECTION_AUTHORIZED_PREFIX) {
            return Ok(Some(Item::Connect(details)));
        }

        // LOG:  disconnection: session time: 0:00:03.861 user=postgres ...
        if message.starts_with(DISCONNECTION_PREFIX) {
            return Ok(Some(Item::Disconnect(details)));
        }

        // Replay works from `connection authorized`, server errors are not
        // replicated, and non-parameter DETAILs carry no work: all three
        // are dropped without comment.
        if message.starts_with(CONNECTION_RECEIVED_PREFIX)
            || message.starts_with("ERROR:")
            || message.starts_with("DETAIL:")
        {
            return Ok(None);
        }

        Err(ParseError::UnrecognisedMessage(message.to_string()))
    }
}

impl Default for ErrlogParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_prepare_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
