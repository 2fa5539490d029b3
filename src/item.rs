//! Replay items, the pipeline's unit of work
//!
//! Every stage of the pipeline moves [`Item`] values in one direction:
//! parsers produce them, the streamer paces them, and session workers
//! execute them. Items serialize to the newline-delimited JSON envelope
//! `{"type": <label>, "item": <body>}` used by the `filter` subcommand,
//! so a preprocessed log round-trips losslessly through the JSON parser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A PostgreSQL backend session key, e.g. `5c7404eb.d6bd` (`%c` in
/// `log_line_prefix`). This is the only routing key the dispatcher uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Fields shared by every replay item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Details {
    #[serde(with = "rfc3339_millis")]
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    pub user: String,
    pub database: String,
}

/// A single unit of replayable work.
///
/// `Connect` and `Disconnect` drive session lifecycle; `Statement` is a
/// simple-protocol query; `BoundExecute` is an extended-protocol execute
/// that has been matched with its (possibly empty) parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "item")]
pub enum Item {
    Connect(Details),
    Disconnect(Details),
    Statement {
        #[serde(flatten)]
        details: Details,
        query: String,
    },
    BoundExecute {
        #[serde(flatten)]
        details: Details,
        query: String,
        /// Positional parameters; `None` is a SQL NULL. All values are
        /// passed to the server as text.
        parameters: Vec<Option<String>>,
    },
}

impl Item {
    pub fn details(&self) -> &Details {
        match self {
            Item::Connect(details) | Item::Disconnect(details) => details,
            Item::Statement { details, .. } | Item::BoundExecute { details, .. } => details,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.details().timestamp
    }

    pub fn session_id(&self) -> &SessionId {
        &self.details().session_id
    }

    pub fn user(&self) -> &str {
        &self.details().user
    }

    pub fn database(&self) -> &str {
        &self.details().database
    }

    /// Label used in the JSON envelope and in event logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Item::Connect(_) => "Connect",
            Item::Disconnect(_) => "Disconnect",
            Item::Statement { .. } => "Statement",
            Item::BoundExecute { .. } => "BoundExecute",
        }
    }
}

/// An extended-protocol execute that is still waiting for its parameters.
///
/// Executes never leave a parser: they sit in the per-session pending slot
/// until a `parameters:` DETAIL or a bare `duration:` line completes them,
/// and are dropped if end-of-stream arrives first.
#[derive(Debug, Clone, PartialEq)]
pub struct Execute {
    pub details: Details,
    pub query: String,
}

impl Execute {
    /// Complete this execute with its parameter list, producing the item
    /// that is actually emitted.
    pub fn bind(self, parameters: Vec<Option<String>>) -> Item {
        Item::BoundExecute {
            details: self.details,
            query: self.query,
            parameters,
        }
    }
}

/// Timestamps serialize as RFC 3339 with millisecond precision, e.g.
/// `2019-02-25T15:08:27.222Z`.
mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
