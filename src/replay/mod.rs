//! Per-session dispatch against a live database
//!
//! The dispatcher owns the session table: the first item seen for a session
//! id opens a dedicated connection and worker for it (whether or not that
//! item is a Connect; captures routinely begin mid-session), and every
//! later item for the session is queued to the same worker. Worker queues
//! are unbounded so one slow session can never head-of-line block the
//! dispatch loop and stall unrelated sessions.

mod session;

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{PlaybackError, Result};
use crate::item::{Item, SessionId};
use crate::shutdown::Shutdown;

use session::SessionHandle;

/// Template connection configuration for replay sessions.
///
/// Host, port and password are shared by every session; user and database
/// are overridden per session from the first item observed for it.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl ReplayConfig {
    pub(crate) fn pg_config(&self, user: &str, database: &str) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(user)
            .dbname(database)
            .application_name("pgplayback");
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }
}

/// Routes items into per-session workers and waits for them to drain.
pub struct Dispatcher {
    config: ReplayConfig,
    shutdown: Shutdown,
}

impl Dispatcher {
    /// Build a dispatcher, verifying connectivity by opening and closing
    /// one connection with the template credentials. Failing here keeps a
    /// misconfigured replay from parsing gigabytes before its first error.
    pub async fn connect(config: ReplayConfig, shutdown: Shutdown) -> Result<Self> {
        let (client, connection) = config
            .pg_config(&config.user, &config.database)
            .connect(tokio_postgres::NoTls)
            .await?;
        let driver = tokio::spawn(connection);
        drop(client);
        let _ = driver.await;

        info!(host = %config.host, port = config.port, "database reachable");
        Ok(Self { config, shutdown })
    }

    /// Consume the item stream until it closes, then drain every session.
    ///
    /// The returned channel carries per-item diagnostics (failed queries,
    /// failed session opens); the join handle resolves once every worker
    /// has terminated.
    pub fn consume(
        self,
        items: mpsc::Receiver<Item>,
    ) -> (mpsc::UnboundedReceiver<PlaybackError>, JoinHandle<()>) {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(items, errors_tx));
        (errors_rx, task)
    }

    async fn run(
        self,
        mut items: mpsc::Receiver<Item>,
        errors: mpsc::UnboundedSender<PlaybackError>,
    ) {
        let mut sessions: HashMap<SessionId, SessionHandle> = HashMap::new();

        loop {
            let item = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = items.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let session_id = item.session_id().clone();

            if !sessions.contains_key(&session_id) {
                match SessionHandle::open(
                    &self.config,
                    &item,
                    errors.clone(),
                    self.shutdown.clone(),
                )
                .await
                {
                    Ok(handle) => {
                        sessions.insert(session_id.clone(), handle);
                    }
                    Err(err) => {
                        // Diagnostic only; the session is retried on its
                        // next item.
                        let _ = errors.send(err);
                        continue;
                    }
                }
            }

            let Some(handle) = sessions.get(&session_id) else {
                continue;
            };
            if !handle.send(item) {
                debug!(session = %session_id, "worker gone, dropping item");
            }
        }

        // Close every queue exactly once, then wait for the workers to
        // finish whatever is already buffered.
        for handle in sessions.values_mut() {
            handle.close();
        }
        for (_, handle) in sessions {
            handle.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReplayConfig {
        ReplayConfig {
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }

    #[test]
    fn sessions_override_template_user_and_database() {
        let pg = config().pg_config("alice", "playback_test");
        assert_eq!(pg.get_user(), Some("alice"));
        assert_eq!(pg.get_dbname(), Some("playback_test"));
        assert_eq!(pg.get_ports(), &[5432]);
    }

    #[test]
    fn empty_password_is_not_set() {
        let pg = config().pg_config("alice", "playback_test");
        assert_eq!(pg.get_password(), None);

        let mut with_password = config();
        with_password.password = "hunter2".to_string();
        let pg = with_password.pg_config("alice", "playback_test");
        assert_eq!(pg.get_password(), Some("hunter2".as_bytes()));
    }
}
