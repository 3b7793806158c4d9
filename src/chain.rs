//! Upstream Chain Seam
//!
//! The two capabilities the pipeline needs from a chain node: a push
//! subscription of full pending transactions, and a receipt lookup by hash.
//! The worker only sees this trait, so tests substitute their own node.

use alloy::consensus::TxEnvelope;
use alloy::primitives::TxHash;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Errors surfaced by a chain client
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Subscription closed by the node")]
    SubscriptionClosed,

    #[error("Receipt lookup failed: {0}")]
    Receipt(String),
}

/// Stream of pending transactions; an `Err` item terminates the subscription
pub type PendingTxStream = BoxStream<'static, Result<TxEnvelope, ChainError>>;

/// Evidence that a transaction was already mined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inclusion {
    pub block_number: Option<u64>,
}

/// A chain node as seen by the ingestion pipeline.
///
/// Implementations must be safe to share across tasks; the pipeline adds no
/// serialization of its own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Open a subscription to full pending transactions
    async fn subscribe_pending(&self) -> Result<PendingTxStream, ChainError>;

    /// Look up the inclusion receipt for `hash`. `Ok(None)` means not mined.
    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Inclusion>, ChainError>;
}
