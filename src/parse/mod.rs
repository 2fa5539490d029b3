//! Log parsing: turning PostgreSQL logs into replay items
//!
//! Three input encodings are supported, each with its own parser driver:
//!
//! - [`parse_errlog`]: stderr-format logs written with
//!   `log_line_prefix = '%m|%u|%d|%c|'`, scanned record-by-record with
//!   continuation-line folding ([`scanner`]).
//! - [`parse_csvlog`]: `log_destination = 'csvlog'` records, decoded by a
//!   CSV reader so multi-line quoted queries are handled.
//! - [`parse_json`]: the preprocessed newline-delimited JSON item log
//!   produced by the `filter` subcommand.
//!
//! Drivers run on the blocking thread pool (file I/O) and push items into a
//! bounded channel; a full buffer suspends the driver, which is the
//! pipeline's backpressure point. Per-line failures go to an error channel
//! and parsing continues; only I/O failures and oversized records end a
//! driver early.

pub mod csvlog;
pub mod errlog;
pub mod json;
pub mod params;
pub mod scanner;

pub use csvlog::parse_csvlog;
pub use errlog::{parse_errlog, ErrlogParser};
pub use json::parse_json;
pub use params::parse_bind_parameters;
pub use scanner::LogScanner;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use metrics::counter;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ParseError, PlaybackError, Result};
use crate::item::Item;
use crate::telemetry::{LOG_LINES_ERROR_TOTAL, LOG_LINES_PARSED_TOTAL};

/// Capacity of the parsed-item channel. Letting the channel buffer makes a
/// significant throughput difference while still bounding parser read-ahead.
pub const ITEM_BUFFER_SIZE: usize = 100;

/// Maximum size, in bytes, of a single logical log record. Queries can
/// carry very large parameter lists, which is why this has to be so big.
pub const MAX_LOG_RECORD_SIZE: usize = 10 * 1024 * 1024;

/// Timestamp layout used by PostgreSQL logs, minus the trailing zone
/// abbreviation: `2019-02-25 15:08:27.222 GMT`.
pub const POSTGRES_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Receiving side of a running parser.
///
/// `items` closes when parsing finishes; `errors` carries per-line
/// diagnostics; `done` resolves with the terminal result (`Err` only for
/// fatal input failures).
pub struct ParserHandle {
    pub items: mpsc::Receiver<Item>,
    pub errors: mpsc::UnboundedReceiver<PlaybackError>,
    pub done: oneshot::Receiver<Result<()>>,
}

/// Sending side handed to a parser driver.
pub(crate) struct ParserSink {
    items: mpsc::Sender<Item>,
    errors: mpsc::UnboundedSender<PlaybackError>,
}

impl ParserSink {
    /// Forward one parse outcome. Returns `false` once the consumer has
    /// gone away and the driver should stop reading.
    pub(crate) fn emit(
        &self,
        outcome: std::result::Result<Option<Item>, ParseError>,
    ) -> bool {
        match outcome {
            Ok(Some(item)) => {
                counter!(LOG_LINES_PARSED_TOTAL).increment(1);
                self.items.blocking_send(item).is_ok()
            }
            Ok(None) => true,
            Err(err) => {
                counter!(LOG_LINES_ERROR_TOTAL).increment(1);
                let _ = self.errors.send(err.into());
                true
            }
        }
    }

    /// Report a non-fatal decode failure that is not a [`ParseError`]
    /// (e.g. a malformed CSV record).
    pub(crate) fn report(&self, err: PlaybackError) {
        counter!(LOG_LINES_ERROR_TOTAL).increment(1);
        let _ = self.errors.send(err);
    }
}

/// Run a parser driver on the blocking pool, wiring up its channels.
pub(crate) fn spawn_parser<F>(parse: F) -> ParserHandle
where
    F: FnOnce(&ParserSink) -> Result<()> + Send + 'static,
{
    let (items_tx, items) = mpsc::channel(ITEM_BUFFER_SIZE);
    let (errors_tx, errors) = mpsc::unbounded_channel();
    let (done_tx, done) = oneshot::channel();

    tokio::task::spawn_blocking(move || {
        let sink = ParserSink {
            items: items_tx,
            errors: errors_tx,
        };
        let _ = done_tx.send(parse(&sink));
    });

    ParserHandle {
        items,
        errors,
        done,
    }
}

/// Parse a PostgreSQL log timestamp such as `2019-02-25 15:08:27.222 GMT`.
///
/// The trailing zone abbreviation is required but not interpreted: the
/// instant is read as UTC. Abbreviations are ambiguous (CST names three
/// zones) and production captures run their log timezone at UTC/GMT.
pub fn parse_log_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, ParseError> {
    let trimmed = raw.trim();
    let (datetime, zone) = trimmed
        .rsplit_once(' ')
        .ok_or_else(|| ParseError::Timestamp(raw.to_string()))?;

    if zone.is_empty() || zone.chars().any(|c| c.is_ascii_digit()) {
        return Err(ParseError::Timestamp(raw.to_string()));
    }

    NaiveDateTime::parse_from_str(datetime, POSTGRES_TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| ParseError::Timestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_timestamp_with_zone_abbreviation() {
        let ts = parse_log_timestamp("2019-02-25 15:08:27.222 GMT").unwrap();
        assert_eq!(
            ts,
            DateTime::parse_from_rfc3339("2019-02-25T15:08:27.222Z")
                .unwrap()
                .with_timezone(&Utc)
        );
    }

    #[test]
    fn rejects_timestamp_without_zone() {
        assert!(parse_log_timestamp("2019-02-25 15:08:27.222").is_err());
    }

    #[test]
    fn rejects_garbage_timestamp() {
        assert!(parse_log_timestamp("not a timestamp UTC").is_err());
        assert!(parse_log_timestamp("").is_err());
    }
}
