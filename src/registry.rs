//! Topic Registry
//!
//! Static mapping from a topic kind to the constructor of the worker that
//! consumes it. Constructors are typed per processing mode, so a topic can
//! only be built through the calling convention it declares.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::info;

use crate::chain::ChainClient;
use crate::config::Config;
use crate::shutdown::CancelScope;
use crate::store::{BucketedFileStore, StoreConfig};
use crate::worker::{IngestWorker, WorkerError};

/// Errors that can occur during topic lookup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("could not find data topic type {0}")]
    NotFound(TopicKind),

    #[error("topic {0} has no constructor")]
    Unwired(TopicKind),

    #[error("topic {kind} declares mode {declared} but its constructor is a {actual} constructor")]
    ModeMismatch {
        kind: TopicKind,
        declared: ProcessMode,
        actual: ProcessMode,
    },
}

/// Kind of upstream data a worker consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TopicKind {
    PendingTransactions,
    Logs,
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKind::PendingTransactions => write!(f, "pending_transactions"),
            TopicKind::Logs => write!(f, "logs"),
        }
    }
}

/// How a worker obtains its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessMode {
    /// Push subscription
    Subscribe,
    /// Pull reads
    Read,
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessMode::Subscribe => write!(f, "subscriber"),
            ProcessMode::Read => write!(f, "reader"),
        }
    }
}

/// Everything a constructor may wire into the worker it builds
pub struct WorkerContext<'a> {
    pub chain: Arc<dyn ChainClient>,
    pub config: &'a Config,
    pub scope: CancelScope,
    /// Background tasks spawned here are drained by the supervisor on shutdown
    pub tasks: &'a mut JoinSet<()>,
}

/// Builds a push-subscription worker
pub type SubscribeConstructor = fn(WorkerContext<'_>) -> Result<IngestWorker, WorkerError>;

/// Typed worker constructor
#[derive(Clone, Copy)]
pub enum Constructor {
    Subscribe(SubscribeConstructor),
}

impl Constructor {
    /// Mode this constructor's signature serves
    pub fn mode(&self) -> ProcessMode {
        match self {
            Constructor::Subscribe(_) => ProcessMode::Subscribe,
        }
    }
}

impl fmt::Debug for Constructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Constructor::{}", self.mode())
    }
}

/// A registered topic
#[derive(Debug, Clone)]
pub struct Topic {
    pub kind: TopicKind,
    pub mode: ProcessMode,
    pub constructor: Option<Constructor>,
}

impl Topic {
    /// The constructor, checked against the declared mode
    pub fn constructor(&self) -> Result<Constructor, RegistryError> {
        let constructor = self.constructor.ok_or(RegistryError::Unwired(self.kind))?;
        if constructor.mode() != self.mode {
            return Err(RegistryError::ModeMismatch {
                kind: self.kind,
                declared: self.mode,
                actual: constructor.mode(),
            });
        }
        Ok(constructor)
    }
}

/// Read-only topic table
#[derive(Debug, Clone)]
pub struct Registry {
    topics: Vec<Topic>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// The built-in table: pending transactions wired, logs reserved
    pub fn new() -> Self {
        Self::with_topics(vec![
            Topic {
                kind: TopicKind::PendingTransactions,
                mode: ProcessMode::Subscribe,
                constructor: Some(Constructor::Subscribe(new_pending_tx_worker)),
            },
            Topic {
                kind: TopicKind::Logs,
                mode: ProcessMode::Read,
                constructor: None,
            },
        ])
    }

    pub fn with_topics(topics: Vec<Topic>) -> Self {
        Self { topics }
    }

    pub fn lookup(&self, kind: TopicKind) -> Result<&Topic, RegistryError> {
        self.topics
            .iter()
            .find(|topic| topic.kind == kind)
            .ok_or(RegistryError::NotFound(kind))
    }
}

/// Pending-transaction worker over a fresh store; starts the store cleaner
pub fn new_pending_tx_worker(ctx: WorkerContext<'_>) -> Result<IngestWorker, WorkerError> {
    let store = Arc::new(BucketedFileStore::new(StoreConfig::new(&ctx.config.data_dir))?);
    info!(store = %store.id(), data_dir = %ctx.config.data_dir.display(), "Created file store");

    let cleaner = {
        let store = Arc::clone(&store);
        let scope = ctx.scope.clone();
        async move { store.run_cleaner(scope).await }
    };
    ctx.tasks.spawn(cleaner);

    Ok(IngestWorker::new(ctx.chain, store, ctx.scope)
        .with_source(ctx.config.source_label.clone())
        .with_policy(ctx.config.subscription_policy)
        .with_queue_capacity(ctx.config.queue_capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use tempfile::TempDir;

    #[test]
    fn test_lookup_pending_transactions() {
        let registry = Registry::new();
        let topic = registry.lookup(TopicKind::PendingTransactions).unwrap();
        assert_eq!(topic.mode, ProcessMode::Subscribe);
        assert!(matches!(topic.constructor(), Ok(Constructor::Subscribe(_))));
    }

    #[test]
    fn test_logs_topic_is_unwired() {
        let registry = Registry::new();
        let topic = registry.lookup(TopicKind::Logs).unwrap();
        assert_eq!(topic.constructor().unwrap_err(), RegistryError::Unwired(TopicKind::Logs));
    }

    #[test]
    fn test_lookup_missing_topic() {
        let registry = Registry::with_topics(vec![]);
        assert_eq!(
            registry.lookup(TopicKind::Logs).unwrap_err(),
            RegistryError::NotFound(TopicKind::Logs)
        );
    }

    #[test]
    fn test_mode_mismatch_is_reported() {
        let registry = Registry::with_topics(vec![Topic {
            kind: TopicKind::Logs,
            mode: ProcessMode::Read,
            constructor: Some(Constructor::Subscribe(new_pending_tx_worker)),
        }]);
        let err = registry.lookup(TopicKind::Logs).unwrap().constructor().unwrap_err();
        assert_eq!(
            err,
            RegistryError::ModeMismatch {
                kind: TopicKind::Logs,
                declared: ProcessMode::Read,
                actual: ProcessMode::Subscribe,
            }
        );
    }

    #[test]
    fn test_display_names() {
        assert_eq!(TopicKind::PendingTransactions.to_string(), "pending_transactions");
        assert_eq!(ProcessMode::Subscribe.to_string(), "subscriber");
        assert_eq!(ProcessMode::Read.to_string(), "reader");
    }

    #[tokio::test]
    async fn test_constructor_spawns_cleaner() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let scope = CancelScope::new();
        let mut tasks = JoinSet::new();

        let worker = new_pending_tx_worker(WorkerContext {
            chain: Arc::new(MockChainClient::new()),
            config: &config,
            scope: scope.clone(),
            tasks: &mut tasks,
        })
        .unwrap();

        assert_eq!(tasks.len(), 1);
        assert!(worker.store().file_cache().is_empty());

        scope.cancel();
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }
}
