//! Ingest Worker
//!
//! Owns one pending-transaction subscription and one processing pipeline.
//! A subscriber task stamps every received transaction and forwards it into a
//! bounded queue; the worker loop drains the queue one event at a time:
//!
//! ```text
//! source log -> dedup check -> validate -> receipt check -> encode -> tx log -> remember
//! ```
//!
//! Every step is fail-open: a failure abandons the current event only.

use alloy::consensus::TxEnvelope;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, ChainError};
use crate::codec::encode_transaction_hex;
use crate::record::{source_line, transaction_line, Event};
use crate::shutdown::CancelScope;
use crate::store::{BucketedFileStore, StoreError};
use crate::validate::{validate_transaction, Rejection};

/// Capacity of the internal event queue. The subscriber waits when it is full.
pub const QUEUE_CAPACITY: usize = 100;

/// Default label written to the source log
pub const DEFAULT_SOURCE: &str = "node";

/// Errors that can occur while running a worker
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker is already running or has run")]
    AlreadyRunning,

    #[error("Upstream subscription lost: {0}")]
    SubscriptionLost(ChainError),

    #[error("Worker stopped before acknowledging close")]
    CloseAborted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the worker does when the upstream subscription ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionPolicy {
    /// Log the loss and keep the worker idle until it is closed
    #[default]
    Halt,
    /// Return [`WorkerError::SubscriptionLost`] from [`IngestWorker::run`]
    FailWorker,
}

/// Pipeline stage at which an event was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Files,
    SourceLog,
    TransactionLog,
}

/// Result of processing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Written to the transaction log and remembered
    Persisted,
    /// Already persisted within the dedup TTL
    Duplicate,
    /// Failed validation
    Rejected(Rejection),
    /// The node already has a receipt for it
    AlreadyIncluded,
    /// An I/O step failed
    Failed(Stage),
}

type CloseAck = oneshot::Sender<()>;

/// Where the worker is in its single run
enum Lifecycle {
    /// Not started; holds the close receiver for `run`
    Ready(mpsc::Receiver<CloseAck>),
    /// `run` has taken the receiver
    Running,
    /// Closed before `run` started
    Closed,
}

/// Pending-transaction worker
pub struct IngestWorker {
    chain: Arc<dyn ChainClient>,
    store: Arc<BucketedFileStore>,
    scope: CancelScope,
    source: String,
    policy: SubscriptionPolicy,
    queue_capacity: usize,
    close_tx: mpsc::Sender<CloseAck>,
    lifecycle: Mutex<Lifecycle>,
}

impl IngestWorker {
    /// Create a worker bound to `store`, cancelled by `scope`
    pub fn new(chain: Arc<dyn ChainClient>, store: Arc<BucketedFileStore>, scope: CancelScope) -> Self {
        let (close_tx, close_rx) = mpsc::channel(1);
        Self {
            chain,
            store,
            scope,
            source: DEFAULT_SOURCE.to_string(),
            policy: SubscriptionPolicy::default(),
            queue_capacity: QUEUE_CAPACITY,
            close_tx,
            lifecycle: Mutex::new(Lifecycle::Ready(close_rx)),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_policy(mut self, policy: SubscriptionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn store(&self) -> &Arc<BucketedFileStore> {
        &self.store
    }

    /// Subscribe and process events until closed or the scope is cancelled.
    ///
    /// Returns an error only for [`SubscriptionPolicy::FailWorker`] when the
    /// subscription is lost, or when called twice. A worker closed before it
    /// started returns `Ok` without subscribing.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let mut close_rx = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Running) {
                Lifecycle::Ready(rx) => rx,
                Lifecycle::Running => return Err(WorkerError::AlreadyRunning),
                Lifecycle::Closed => {
                    *lifecycle = Lifecycle::Closed;
                    debug!("Ingest worker closed before it started");
                    return Ok(());
                }
            }
        };

        debug!("Starting ingest worker");

        let (events_tx, mut events_rx) = mpsc::channel(self.queue_capacity);
        let job = CancelScope::new();
        let mut subscriber = tokio::spawn(subscribe(
            Arc::clone(&self.chain),
            events_tx,
            self.source.clone(),
            self.scope.clone(),
            job.clone(),
        ));
        let mut subscriber_live = true;

        let cancelled = self.scope.cancelled();
        tokio::pin!(cancelled);

        loop {
            tokio::select! {
                biased;

                ack = close_rx.recv() => {
                    debug!("Shutting down ingest worker");
                    stop_subscriber(&job, &mut subscriber, subscriber_live).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return Ok(());
                }

                _ = &mut cancelled => {
                    debug!("Scope cancelled, shutting down ingest worker");
                    stop_subscriber(&job, &mut subscriber, subscriber_live).await;
                    // Acknowledge a close that raced the cancellation; later ones fail to send
                    close_rx.close();
                    while let Ok(ack) = close_rx.try_recv() {
                        let _ = ack.send(());
                    }
                    return Ok(());
                }

                Some(event) = events_rx.recv() => {
                    self.process_tx(event).await;
                }

                result = &mut subscriber, if subscriber_live => {
                    subscriber_live = false;
                    match result {
                        Ok(Ok(())) => debug!("Subscriber stopped"),
                        Ok(Err(e)) => {
                            error!(error = %e, "Subscription error");
                            if self.policy == SubscriptionPolicy::FailWorker {
                                return Err(WorkerError::SubscriptionLost(e));
                            }
                            warn!("Subscription lost, worker is idle until closed");
                        }
                        Err(e) => error!("Subscriber task failed: {}", e),
                    }
                }
            }
        }
    }

    /// Signal the worker loop to stop and wait for the subscriber to exit.
    ///
    /// There is no timeout. Closing before `run` starts makes that `run`
    /// return immediately; closing after the loop has returned is a no-op.
    pub async fn close(&self) -> Result<(), WorkerError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match &*lifecycle {
                Lifecycle::Ready(_) => {
                    *lifecycle = Lifecycle::Closed;
                    return Ok(());
                }
                Lifecycle::Closed => return Ok(()),
                Lifecycle::Running => {}
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.close_tx.send(ack_tx).await.is_err() {
            return Ok(());
        }
        ack_rx.await.map_err(|_| WorkerError::CloseAborted)
    }

    /// Run one event through the pipeline
    pub async fn process_tx(&self, event: Event) -> Outcome {
        let hash = event.hash();
        let arrival_ms = event.arrival_ms();

        debug!(tx_hash = %hash, source = %event.source, "Processing tx");

        let files = match self.store.files_for(event.timestamp) {
            Ok(files) => files,
            Err(e) => {
                error!(tx_hash = %hash, error = %e, "Failed to get bucket files");
                return Outcome::Failed(Stage::Files);
            }
        };

        if let Err(e) = files.append_source(&source_line(arrival_ms, &hash, &event.source)) {
            error!(tx_hash = %hash, error = %e, "Failed to store source log line");
            return Outcome::Failed(Stage::SourceLog);
        }

        if let Ok(first_seen) = self.store.recorded_at(&hash) {
            debug!(tx_hash = %hash, %first_seen, "Transaction already processed");
            return Outcome::Duplicate;
        }

        if let Err(rejection) = validate_transaction(&event.tx) {
            info!(tx_hash = %hash, %rejection, "Rejected transaction");
            return Outcome::Rejected(rejection);
        }

        if self.is_included(&event.tx, &hash).await {
            return Outcome::AlreadyIncluded;
        }

        let payload = encode_transaction_hex(&event.tx);
        if let Err(e) = files.append_transaction(&transaction_line(arrival_ms, &hash, &payload)) {
            error!(tx_hash = %hash, error = %e, "Failed to store tx in file");
            return Outcome::Failed(Stage::TransactionLog);
        }

        self.store.remember(&hash, event.timestamp);
        Outcome::Persisted
    }

    async fn is_included(&self, tx: &TxEnvelope, hash: &str) -> bool {
        match self.chain.transaction_receipt(*tx.tx_hash()).await {
            Ok(Some(inclusion)) => {
                info!(tx_hash = %hash, block = ?inclusion.block_number, "Tx already included");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(tx_hash = %hash, error = %e, "Receipt lookup failed, treating as pending");
                false
            }
        }
    }
}

/// Cancel the subscriber job and wait for it, unless it already finished
async fn stop_subscriber(
    job: &CancelScope,
    subscriber: &mut JoinHandle<Result<(), ChainError>>,
    live: bool,
) {
    job.cancel();
    if live {
        if let Err(e) = subscriber.await {
            error!("Subscriber task failed: {}", e);
        }
    }
}

/// Resolves when either scope is cancelled
async fn stopped(scope: &CancelScope, job: &CancelScope) {
    tokio::select! {
        _ = scope.cancelled() => {}
        _ = job.cancelled() => {}
    }
}

/// Subscriber task: forwards stamped transactions until cancelled or the stream fails
async fn subscribe(
    chain: Arc<dyn ChainClient>,
    events: mpsc::Sender<Event>,
    source: String,
    scope: CancelScope,
    job: CancelScope,
) -> Result<(), ChainError> {
    let mut stream = tokio::select! {
        _ = stopped(&scope, &job) => return Ok(()),
        stream = chain.subscribe_pending() => stream?,
    };

    info!("Subscribed to pending transactions");

    loop {
        let tx = tokio::select! {
            _ = stopped(&scope, &job) => return Ok(()),
            item = stream.next() => match item {
                Some(Ok(tx)) => tx,
                Some(Err(e)) => return Err(e),
                None => return Err(ChainError::SubscriptionClosed),
            },
        };

        let event = Event::received(tx, source.as_str());
        tokio::select! {
            _ = stopped(&scope, &job) => return Ok(()),
            sent = events.send(event) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Inclusion, MockChainClient, PendingTxStream};
    use crate::codec::fixtures::signed_eip1559;
    use crate::store::StoreConfig;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<BucketedFileStore> {
        Arc::new(BucketedFileStore::new(StoreConfig::new(dir.path())).unwrap())
    }

    fn worker(chain: MockChainClient, store: Arc<BucketedFileStore>) -> IngestWorker {
        IngestWorker::new(Arc::new(chain), store, CancelScope::new())
    }

    fn pending_chain() -> MockChainClient {
        let mut chain = MockChainClient::new();
        chain.expect_transaction_receipt().returning(|_| Ok(None));
        chain
    }

    fn lines(path: &std::path::Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    // ==================== process_tx tests ====================

    #[tokio::test]
    async fn test_process_persists_valid_pending_tx() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let worker = worker(pending_chain(), Arc::clone(&store));

        let event = Event::received(signed_eip1559(0, 30_000_000_000, 1_000_000_000), "node");
        let hash = event.hash();
        let ts = event.timestamp;

        assert_eq!(worker.process_tx(event).await, Outcome::Persisted);

        let files = store.files_for(ts).unwrap();
        let source = lines(files.source_log_path());
        let txs = lines(files.transaction_log_path());
        assert_eq!(source, vec![format!("{},{},node", ts.timestamp_millis(), hash)]);
        assert_eq!(txs.len(), 1);
        assert!(txs[0].starts_with(&format!("{},{},0x02", ts.timestamp_millis(), hash)));
        assert_eq!(store.recorded_at(&hash).unwrap(), ts);
    }

    #[tokio::test]
    async fn test_process_skips_duplicate_but_logs_source() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let worker = worker(pending_chain(), Arc::clone(&store));

        let tx = signed_eip1559(0, 30_000_000_000, 1_000_000_000);
        let first = Event::received(tx.clone(), "node");
        let second = Event::received(tx, "node");
        let ts = first.timestamp;

        assert_eq!(worker.process_tx(first).await, Outcome::Persisted);
        assert_eq!(worker.process_tx(second).await, Outcome::Duplicate);

        let files = store.files_for(ts).unwrap();
        assert_eq!(lines(files.source_log_path()).len(), 2);
        assert_eq!(lines(files.transaction_log_path()).len(), 1);
    }

    #[tokio::test]
    async fn test_process_rejects_tip_above_fee_cap() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut chain = MockChainClient::new();
        chain.expect_transaction_receipt().never();
        let worker = worker(chain, Arc::clone(&store));

        let event = Event::received(signed_eip1559(0, 1_000_000_000, 2_000_000_000), "node");
        let hash = event.hash();
        let ts = event.timestamp;

        assert!(matches!(
            worker.process_tx(event).await,
            Outcome::Rejected(Rejection::TipAboveFeeCap { .. })
        ));

        let files = store.files_for(ts).unwrap();
        assert_eq!(lines(files.source_log_path()).len(), 1);
        assert!(lines(files.transaction_log_path()).is_empty());
        assert!(store.recorded_at(&hash).is_err());
    }

    #[tokio::test]
    async fn test_process_skips_included_tx() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut chain = MockChainClient::new();
        chain
            .expect_transaction_receipt()
            .times(1)
            .returning(|_| Ok(Some(Inclusion { block_number: Some(12) })));
        let worker = worker(chain, Arc::clone(&store));

        let event = Event::received(signed_eip1559(0, 30_000_000_000, 1_000_000_000), "node");
        let hash = event.hash();
        let ts = event.timestamp;

        assert_eq!(worker.process_tx(event).await, Outcome::AlreadyIncluded);

        let files = store.files_for(ts).unwrap();
        assert_eq!(lines(files.source_log_path()).len(), 1);
        assert!(lines(files.transaction_log_path()).is_empty());
        assert!(store.recorded_at(&hash).is_err());
    }

    #[tokio::test]
    async fn test_process_receipt_error_still_persists() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut chain = MockChainClient::new();
        chain
            .expect_transaction_receipt()
            .returning(|_| Err(ChainError::Receipt("node busy".to_string())));
        let worker = worker(chain, Arc::clone(&store));

        let event = Event::received(signed_eip1559(0, 30_000_000_000, 1_000_000_000), "node");
        assert_eq!(worker.process_tx(event).await, Outcome::Persisted);
    }

    #[tokio::test]
    async fn test_process_fails_open_when_files_unavailable() {
        let dir = TempDir::new().unwrap();
        // A regular file where the data dir should be
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"").unwrap();
        let store = Arc::new(BucketedFileStore::new(StoreConfig::new(&blocker)).unwrap());
        let worker = worker(pending_chain(), store);

        let event = Event::received(signed_eip1559(0, 30_000_000_000, 1_000_000_000), "node");
        assert_eq!(worker.process_tx(event).await, Outcome::Failed(Stage::Files));
    }

    // ==================== run / close tests ====================

    fn channel_stream() -> (mpsc::Sender<Result<TxEnvelope, ChainError>>, PendingTxStream) {
        let (tx, rx) = mpsc::channel(16);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, stream.boxed())
    }

    #[tokio::test]
    async fn test_close_before_run_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let worker = worker(MockChainClient::new(), store(&dir));
        tokio::time::timeout(Duration::from_secs(1), worker.close())
            .await
            .expect("close should not block")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_twice_is_an_error() {
        let dir = TempDir::new().unwrap();
        let worker = worker(MockChainClient::new(), store(&dir));
        // As left behind by a finished run
        *worker.lifecycle.lock() = Lifecycle::Running;
        assert!(matches!(worker.run().await, Err(WorkerError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_close_before_run_stops_that_run() {
        let dir = TempDir::new().unwrap();
        let mut chain = MockChainClient::new();
        chain.expect_subscribe_pending().never();
        let worker = worker(chain, store(&dir));

        worker.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .expect("run should return after an earlier close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_scope_cancel_stops_run_without_close() {
        let dir = TempDir::new().unwrap();
        let mut chain = pending_chain();
        chain
            .expect_subscribe_pending()
            .returning(|| Ok(futures::stream::pending().boxed()));
        let scope = CancelScope::new();
        let worker = IngestWorker::new(Arc::new(chain), store(&dir), scope.clone());

        // Cancelled before the loop is first polled
        scope.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .expect("run should observe the cancelled scope")
            .unwrap();

        // The loop is gone, so close has nothing to wait for
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_waits_for_subscriber_exit() {
        let dir = TempDir::new().unwrap();
        let (upstream, stream) = channel_stream();
        let mut chain = pending_chain();
        chain.expect_subscribe_pending().return_once(move || Ok(stream));

        let worker = Arc::new(worker(chain, store(&dir)));
        let runner = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };

        upstream
            .send(Ok(signed_eip1559(0, 30_000_000_000, 1_000_000_000)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        worker.close().await.unwrap();

        // The subscriber dropped its stream on the way out
        assert!(upstream.is_closed());
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fail_worker_policy_surfaces_subscription_loss() {
        let dir = TempDir::new().unwrap();
        let (upstream, stream) = channel_stream();
        let mut chain = pending_chain();
        chain.expect_subscribe_pending().return_once(move || Ok(stream));

        let worker = worker(chain, store(&dir)).with_policy(SubscriptionPolicy::FailWorker);

        upstream
            .send(Err(ChainError::Subscription("reset".to_string())))
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .expect("run should return on subscription loss");
        assert!(matches!(result, Err(WorkerError::SubscriptionLost(_))));

        // Nothing left to close
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_halt_policy_keeps_worker_idle() {
        let dir = TempDir::new().unwrap();
        let mut chain = pending_chain();
        chain
            .expect_subscribe_pending()
            .return_once(|| Err(ChainError::Subscription("refused".to_string())));

        let worker = Arc::new(worker(chain, store(&dir)));
        let runner = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!runner.is_finished());

        worker.close().await.unwrap();
        runner.await.unwrap().unwrap();
    }

    #[test]
    fn test_subscription_policy_default_is_halt() {
        assert_eq!(SubscriptionPolicy::default(), SubscriptionPolicy::Halt);
    }
}
