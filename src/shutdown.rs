//! Global cancellation signal
//!
//! One [`Shutdown`] handle is created per run and cloned into every stage.
//! Blocking loops poll [`Shutdown::is_requested`]; async stages race
//! [`Shutdown::cancelled`] against their receives and sleeps, so a request
//! interrupts in-progress pacing sleeps immediately and lets each session
//! worker stop after its in-flight query.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    /// Request shutdown. Idempotent; wakes every pending `cancelled()`.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.notify.send(());
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn cancelled(&self) {
        // Subscribe before re-checking the flag so a request landing in
        // between cannot be missed.
        let mut receiver = self.notify.subscribe();
        if self.is_requested() {
            return;
        }
        let _ = receiver.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_request() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };

        shutdown.request();
        waiter.await.unwrap();
        assert!(shutdown.is_requested());
    }

    #[tokio::test]
    async fn cancelled_resolves_when_already_requested() {
        let shutdown = Shutdown::new();
        shutdown.request();
        shutdown.request();
        shutdown.cancelled().await;
    }
}
