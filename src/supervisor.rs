//! Pipeline Supervisor
//!
//! Builds the worker for the configured topic, runs it on a tracked task, and
//! owns the cancellation scope shared by every task of the pipeline. After
//! [`Supervisor::shutdown`] returns, no task spawned through the supervisor is
//! left running.

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::chain::ChainClient;
use crate::config::Config;
use crate::registry::{Constructor, Registry, RegistryError, WorkerContext};
use crate::shutdown::CancelScope;
use crate::worker::{IngestWorker, WorkerError};

/// Errors that can occur while supervising the pipeline
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to construct worker: {0}")]
    Construct(#[from] WorkerError),

    #[error("No worker has been created")]
    NoWorker,
}

pub struct Supervisor {
    registry: Registry,
    chain: Arc<dyn ChainClient>,
    scope: CancelScope,
    worker: Option<Arc<IngestWorker>>,
    tasks: JoinSet<()>,
}

impl Supervisor {
    pub fn new(registry: Registry, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            registry,
            chain,
            scope: CancelScope::new(),
            worker: None,
            tasks: JoinSet::new(),
        }
    }

    /// Handle to the shared scope, for signal listeners
    pub fn scope(&self) -> CancelScope {
        self.scope.clone()
    }

    pub fn worker(&self) -> Option<&Arc<IngestWorker>> {
        self.worker.as_ref()
    }

    /// Number of tracked background tasks still owned by the supervisor
    pub fn tracked_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Build the worker for `config.topic`
    pub fn create_worker(&mut self, config: &Config) -> Result<(), SupervisorError> {
        let topic = self.registry.lookup(config.topic)?;
        let constructor = topic.constructor()?;

        debug!(topic = %topic.kind, mode = %topic.mode, "Constructing worker");

        let worker = match constructor {
            Constructor::Subscribe(build) => build(WorkerContext {
                chain: Arc::clone(&self.chain),
                config,
                scope: self.scope.clone(),
                tasks: &mut self.tasks,
            })?,
        };

        self.worker = Some(Arc::new(worker));
        Ok(())
    }

    /// Run the worker on a tracked task, plus a watcher that reports cancellation.
    /// Returns without waiting for either.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        let worker = Arc::clone(self.worker.as_ref().ok_or(SupervisorError::NoWorker)?);

        self.tasks.spawn(async move {
            debug!("Starting worker");
            if let Err(e) = worker.run().await {
                error!(error = %e, "Obtained error from worker loop");
            }
        });

        let scope = self.scope.clone();
        self.tasks.spawn(async move {
            scope.cancelled().await;
            info!("Shutting down pipeline");
        });

        Ok(())
    }

    /// Resolves once the shared scope is cancelled
    pub async fn await_cancellation(&self) {
        self.scope.cancelled().await
    }

    /// Cancel the scope, close the worker, and wait for every tracked task
    pub async fn shutdown(&mut self) {
        self.scope.cancel();

        if let Some(worker) = &self.worker {
            if let Err(e) = worker.close().await {
                error!(error = %e, "Failed to close worker");
            }
        }

        debug!("Waiting for all pipeline tasks to end");
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pipeline task failed");
            }
        }
    }
}
