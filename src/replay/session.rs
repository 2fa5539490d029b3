//! Session workers
//!
//! One worker per captured session, each owning a database connection
//! opened with the session's original user and database. A worker executes
//! its items strictly in order on that single connection; query failures
//! are diagnostic and the worker moves on, but a lost connection ends the
//! session and later items for it are dropped by the dispatcher.

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use tracing::{debug, warn};

use crate::error::{PlaybackError, Result};
use crate::item::{Item, SessionId};
use crate::shutdown::Shutdown;
use crate::telemetry::{
    CONNECTIONS_ACTIVE, CONNECTIONS_ESTABLISHED_TOTAL, ITEMS_MOST_RECENT_TIMESTAMP,
    ITEMS_PROCESSED_TOTAL,
};

use super::ReplayConfig;

/// Dispatcher-side handle to a running session worker.
pub(crate) struct SessionHandle {
    // Taken exactly once on close, so shutdown racing end-of-stream can
    // never close a queue twice.
    queue: Option<mpsc::UnboundedSender<Item>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Open a connection for the session that produced `first` and start
    /// its worker.
    pub(crate) async fn open(
        config: &ReplayConfig,
        first: &Item,
        errors: mpsc::UnboundedSender<PlaybackError>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let session = first.session_id().clone();
        let (client, connection) = config
            .pg_config(first.user(), first.database())
            .connect(tokio_postgres::NoTls)
            .await?;

        // Drive the connection until the client is dropped.
        {
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    debug!(session = %session, error = %err, "connection driver ended");
                }
            });
        }

        counter!(CONNECTIONS_ESTABLISHED_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        debug!(
            session = %session,
            user = first.user(),
            database = first.database(),
            "session opened"
        );

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(session, client, queue_rx, errors, shutdown));

        Ok(Self {
            queue: Some(queue_tx),
            task,
        })
    }

    /// Queue an item; `false` once the worker has terminated.
    pub(crate) fn send(&self, item: Item) -> bool {
        match &self.queue {
            Some(queue) => queue.send(item).is_ok(),
            None => false,
        }
    }

    /// Close the inbound queue. Idempotent.
    pub(crate) fn close(&mut self) {
        self.queue.take();
    }

    /// Close the queue (if still open) and wait for the worker to exit.
    pub(crate) async fn join(mut self) {
        self.queue.take();
        let _ = self.task.await;
    }
}

async fn run_session(
    session: SessionId,
    client: Client,
    mut queue: mpsc::UnboundedReceiver<Item>,
    errors: mpsc::UnboundedSender<PlaybackError>,
    shutdown: Shutdown,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(session = %session, "abandoning queue for shutdown");
                break;
            }
            item = queue.recv() => match item {
                Some(item) => item,
                // Queue drained with the connection still healthy: the
                // capture ended before this session disconnected, so a
                // disconnect is synthesized by falling out of the loop.
                None => break,
            },
        };

        counter!(ITEMS_PROCESSED_TOTAL).increment(1);
        gauge!(ITEMS_MOST_RECENT_TIMESTAMP).set(item.timestamp().timestamp() as f64);

        match item {
            // The connection was opened when the worker started.
            Item::Connect(_) => {}
            Item::Disconnect(_) => break,
            Item::Statement { query, .. } => {
                if let Err(err) = client.batch_execute(&query).await {
                    let _ = errors.send(err.into());
                }
            }
            Item::BoundExecute {
                query, parameters, ..
            } => {
                let params: Vec<&(dyn ToSql + Sync)> = parameters
                    .iter()
                    .map(|param| param as &(dyn ToSql + Sync))
                    .collect();
                if let Err(err) = client.execute(query.as_str(), &params).await {
                    let _ = errors.send(err.into());
                }
            }
        }

        if client.is_closed() {
            warn!(session = %session, "connection lost, session terminated");
            break;
        }
    }

    // Dropping the client closes the connection.
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    debug!(session = %session, "session closed");
}
