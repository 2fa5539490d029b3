//! Error types for pgplayback
//!
//! Two tiers of failure exist in the pipeline: per-line diagnostics
//! ([`ParseError`]) that are reported and skipped, and everything else
//! ([`PlaybackError`]) which ends the run with an orderly drain.

use thiserror::Error;

/// Result type alias for pgplayback operations
pub type Result<T> = std::result::Result<T, PlaybackError>;

/// Main error type for pgplayback
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV decode error: {0}")]
    Csv(#[from] csv::Error),

    #[error("log record exceeds maximum size of {limit} bytes")]
    RecordTooLarge { limit: usize },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Replay is shutting down")]
    ShuttingDown,
}

/// Per-line parse diagnostics.
///
/// These never stop a parser; they are pushed down the parser's error
/// channel and logged by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("failed to parse log line: '{0}'")]
    MalformedLine(String),

    #[error("failed to parse log timestamp: '{0}'")]
    Timestamp(String),

    #[error("truncated CSV log record: expected at least {expected} fields, got {got}")]
    ShortRecord { expected: usize, got: usize },

    #[error("no parser matches line: {0}")]
    UnrecognisedMessage(String),

    /// Expected noise under `log_min_duration_statement = 0`, where the
    /// bind step logs a parameters DETAIL before any execute is seen.
    #[error("cannot process bind parameters without previous execute item: {0}")]
    UnmatchedParameters(String),

    #[error("could not parse parameter: {0}")]
    Parameter(String),

    #[error("could not find closing ' for parameter: {0}")]
    UnterminatedParameter(String),

    #[error("failed to decode item: {0}")]
    ItemDecode(String),
}
