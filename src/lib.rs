#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # pgplayback
//!
//! Replay PostgreSQL query traffic captured in server log files against a
//! live database, preserving the wall-clock spacing between statements so
//! the target experiences load shaped like the original workload. Used to
//! compare hardware, configuration or version changes by replaying the
//! same capture at a baseline and a candidate cluster.
//!
//! ## Pipeline
//!
//! Data flows one way through four stages:
//!
//! 1. **Scanner** ([`parse::scanner`]): byte stream → logical log records,
//!    folding tab-marked continuation lines.
//! 2. **Parser** ([`parse`]): records → typed replay [`Item`]s, with
//!    stderr (`errlog`), CSV (`csvlog`) and preprocessed JSON frontends.
//! 3. **Streamer** ([`stream`]): time-window filtering and rate-scaled
//!    pacing.
//! 4. **Dispatcher** ([`replay`]): one worker and one connection per
//!    captured session, session-affine routing, graceful drain.
//!
//! ## Capturing logs
//!
//! The stderr frontend expects logs produced with:
//!
//! ```text
//! log_line_prefix = '%m|%u|%d|%c|'
//! log_statement = 'all'
//! log_connections = on
//! log_disconnections = on
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Preprocess a capture into the JSON item log (fast to re-replay)
//! $ pgplayback filter --errlog-input postgres.log --output capture.json
//!
//! # Replay at double speed against a candidate cluster
//! $ pgplayback run --json-input capture.json --host 10.0.0.2 --replay-rate 2
//! ```
//!
//! Prometheus metrics for the run are served on `/metrics` (see
//! [`telemetry`]).

pub mod config;
pub mod error;
pub mod item;
pub mod parse;
pub mod replay;
pub mod shutdown;
pub mod stream;
pub mod telemetry;

pub use error::{ParseError, PlaybackError, Result};
pub use item::{Details, Execute, Item, SessionId};
pub use parse::{parse_csvlog, parse_errlog, parse_json, ParserHandle};
pub use replay::{Dispatcher, ReplayConfig};
pub use shutdown::Shutdown;
pub use stream::Streamer;
