//! Command-line arguments for pgplayback
//!
//! This module defines the CLI surface using clap. Global flags (window
//! bounds, debug logging, metrics listener) apply to both subcommands;
//! input selection is shared between them and validated to exactly one
//! format per invocation.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::error::{PlaybackError, Result};
use crate::parse::parse_log_timestamp;
use crate::replay::ReplayConfig;

/// Command-line arguments for pgplayback
#[derive(Parser, Debug)]
#[command(name = "pgplayback")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Replay captured PostgreSQL query traffic against a live database")]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true, env = "PGPLAYBACK_DEBUG")]
    pub debug: bool,

    /// Play items from this time onward (YYYY-MM-DD HH:MM:SS.mmm TZ)
    #[arg(long, global = true, value_parser = parse_time_flag)]
    pub start: Option<DateTime<Utc>>,

    /// Stop playing items at this time (YYYY-MM-DD HH:MM:SS.mmm TZ)
    #[arg(long, global = true, value_parser = parse_time_flag)]
    pub finish: Option<DateTime<Utc>>,

    /// Address to bind the metrics HTTP listener
    #[arg(
        long,
        global = true,
        env = "PGPLAYBACK_METRICS_ADDRESS",
        default_value = "127.0.0.1"
    )]
    pub metrics_address: String,

    /// Port to bind the metrics HTTP listener
    #[arg(long, global = true, env = "PGPLAYBACK_METRICS_PORT", default_value_t = 9445)]
    pub metrics_port: u16,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process a PostgreSQL log into a preprocessed JSON item log
    Filter(FilterArgs),
    /// Replay a log file against a real database
    Run(RunArgs),
}

/// Input selection, shared by both subcommands. Exactly one format must be
/// supplied.
#[derive(Args, Debug, Default)]
pub struct InputArgs {
    /// Path to a preprocessed JSON item log
    #[arg(long, value_name = "FILE")]
    pub json_input: Option<PathBuf>,

    /// Path to a PostgreSQL stderr-format log
    #[arg(long, value_name = "FILE")]
    pub errlog_input: Option<PathBuf>,

    /// Path to a PostgreSQL csvlog-format log
    #[arg(long, value_name = "FILE")]
    pub csvlog_input: Option<PathBuf>,
}

/// The single input format resolved from [`InputArgs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFormat {
    Json(PathBuf),
    Errlog(PathBuf),
    Csvlog(PathBuf),
}

impl InputArgs {
    pub fn resolve(&self) -> Result<InputFormat> {
        let mut formats = Vec::new();
        if let Some(path) = &self.json_input {
            formats.push(InputFormat::Json(path.clone()));
        }
        if let Some(path) = &self.errlog_input {
            formats.push(InputFormat::Errlog(path.clone()));
        }
        if let Some(path) = &self.csvlog_input {
            formats.push(InputFormat::Csvlog(path.clone()));
        }

        match formats.len() {
            1 => Ok(formats.remove(0)),
            _ => Err(PlaybackError::Config(
                "must provide exactly one input format".to_string(),
            )),
        }
    }
}

#[derive(Args, Debug)]
pub struct FilterArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// JSON output file
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Don't output anything, for testing parsing only
    #[arg(long)]
    pub null_output: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// PostgreSQL database host
    #[arg(long, env = "PGPLAYBACK_HOST")]
    pub host: String,

    /// PostgreSQL database port
    #[arg(long, env = "PGPLAYBACK_PORT", default_value_t = 5432)]
    pub port: u16,

    /// PostgreSQL root database
    #[arg(long, env = "PGPLAYBACK_DATABASE", default_value = "postgres")]
    pub database: String,

    /// PostgreSQL root user
    #[arg(long, env = "PGPLAYBACK_USER", default_value = "postgres")]
    pub user: String,

    /// PostgreSQL password, applied to every session
    #[arg(long, env = "PGPLAYBACK_PASSWORD", default_value = "")]
    pub password: String,

    /// Rate of playback; queries are executed at N times capture speed
    #[arg(long, default_value_t = 1.0)]
    pub replay_rate: f64,
}

impl RunArgs {
    pub fn replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

fn parse_time_flag(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_log_timestamp(raw)
        .map_err(|_| format!("must be a valid timestamp (YYYY-MM-DD HH:MM:SS.mmm TZ): '{raw}'"))
}
