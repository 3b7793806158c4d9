//! TxnScope Recorder Library
//!
//! This crate provides components for recording pending blockchain transactions
//! seen by a node: validation, dedup, and append-only CSV logs bucketed by
//! arrival hour.

pub mod chain;
pub mod codec;
pub mod config;
pub mod logging;
pub mod node;
pub mod record;
pub mod registry;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod validate;
pub mod worker;

// Re-export commonly used types
pub use chain::{ChainClient, ChainError, Inclusion, PendingTxStream};
pub use config::{Config, Environment};
pub use node::{NodeClient, NodeConfig};
pub use record::Event;
pub use registry::{Registry, TopicKind};
pub use shutdown::CancelScope;
pub use store::{BucketedFileStore, StoreConfig, StoreError};
pub use supervisor::{Supervisor, SupervisorError};
pub use worker::{IngestWorker, Outcome, SubscriptionPolicy};
