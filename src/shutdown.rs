//! Cancellation Scope
//!
//! A cloneable, one-way cancellation flag shared by every task of the pipeline.
//! Built on a `tokio::sync::watch` channel: cancelling flips the value once and
//! wakes every waiter.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared cancellation scope
#[derive(Debug, Clone)]
pub struct CancelScope {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    /// Create a new, not yet cancelled scope
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel the scope. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the scope has been cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the scope is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
