//! Metrics collection and exposition
//!
//! All pipeline stages publish process-wide counters and gauges through the
//! `metrics` facade; this module installs the Prometheus recorder once at
//! startup and serves the rendered registry over HTTP.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::info;

use crate::error::Result;
use crate::shutdown::Shutdown;

// Metric names, shared by the stages that update them.
pub const CONNECTIONS_ACTIVE: &str = "pgplayback_connections_active";
pub const CONNECTIONS_ESTABLISHED_TOTAL: &str = "pgplayback_connections_established_total";
pub const ITEMS_PROCESSED_TOTAL: &str = "pgplayback_items_processed_total";
pub const ITEMS_MOST_RECENT_TIMESTAMP: &str = "pgplayback_items_most_recent_timestamp";
pub const LOG_LINES_PARSED_TOTAL: &str = "pgplayback_log_lines_parsed_total";
pub const LOG_LINES_ERROR_TOTAL: &str = "pgplayback_log_lines_error_total";
pub const ITEMS_FILTERED_TOTAL: &str = "pgplayback_items_filtered_total";
pub const ITEMS_FILTER_PROGRESS_FRACTION: &str = "pgplayback_items_filter_progress_fraction";
pub const ITEMS_LAST_STREAMED_TIMESTAMP: &str = "pgplayback_items_last_streamed_timestamp";

static RECORDER_INSTALLED: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and register metric descriptions.
///
/// The recorder is process-global, so this can only take effect once; later
/// calls return the handle from the first installation (first call wins,
/// which also keeps tests that race on initialization well-behaved).
pub fn install() -> PrometheusHandle {
    if let Some(handle) = RECORDER_INSTALLED.get() {
        return handle.clone();
    }

    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            describe_metrics();
            handle
        }
        // A recorder was installed elsewhere (another test in the same
        // process); build an unconnected handle so rendering still works.
        Err(_) => PrometheusBuilder::new().build_recorder().handle(),
    };

    let _ = RECORDER_INSTALLED.set(handle.clone());
    handle
}

fn describe_metrics() {
    describe_gauge!(
        CONNECTIONS_ACTIVE,
        "Number of connections currently open against Postgres"
    );
    describe_counter!(
        CONNECTIONS_ESTABLISHED_TOTAL,
        "Number of connections established against Postgres"
    );
    describe_counter!(
        ITEMS_PROCESSED_TOTAL,
        "Total count of replay items that have been sent to the database"
    );
    describe_gauge!(
        ITEMS_MOST_RECENT_TIMESTAMP,
        "Most recent timestamp of processed items"
    );
    describe_counter!(
        LOG_LINES_PARSED_TOTAL,
        "Number of log lines parsed since boot"
    );
    describe_counter!(
        LOG_LINES_ERROR_TOTAL,
        "Number of log lines that failed to parse"
    );
    describe_counter!(
        ITEMS_FILTERED_TOTAL,
        "Number of items filtered by start/finish range"
    );
    describe_gauge!(
        ITEMS_FILTER_PROGRESS_FRACTION,
        "Fractional progress through filter range, assuming linear distribution"
    );
    describe_gauge!(
        ITEMS_LAST_STREAMED_TIMESTAMP,
        "Timestamp of last streamed item"
    );
}

/// Serve `/metrics` and `/health` until shutdown is requested.
pub async fn serve(address: &str, port: u16, handle: PrometheusHandle, shutdown: Shutdown) -> Result<()> {
    let addr: SocketAddr = format!("{address}:{port}")
        .parse()
        .map_err(|err| crate::error::PlaybackError::Config(format!("metrics address: {err}")))?;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(handle);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "metrics listener started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Metrics endpoint handler (Prometheus text format)
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> Response {
    (StatusCode::OK, handle.render()).into_response()
}

/// Liveness endpoint handler
async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        let first = install();
        let second = install();
        // Both handles render without panicking; the recorder is only
        // installed once per process.
        let _ = first.render();
        let _ = second.render();
    }
}
