//! Bucketed File Store
//!
//! Persists pipeline output into UTC-aligned time buckets:
//!
//! ```text
//! <data-dir>/<YYYY-MM-DD>/transactions/txs_<YYYY-MM-DD_HH-MM>_<store-id>.csv
//! <data-dir>/<YYYY-MM-DD>/sourcelog/src_<YYYY-MM-DD_HH-MM>_<store-id>.csv
//! ```
//!
//! The store composes two independently locked caches, [`FileCache`] and
//! [`DedupCache`]. No operation holds both locks. A background cleaner evicts
//! stale entries from each until its cancellation scope fires.

pub mod dedup;
pub mod files;

use chrono::{DateTime, TimeDelta, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::shutdown::CancelScope;

pub use dedup::DedupCache;
pub use files::{bucket_key, FileCache, OutputFileSet};

/// Width of one bucket
pub const BUCKET_DURATION: Duration = Duration::from_secs(60 * 60);

/// How long a persisted hash is remembered
pub const DEDUP_TTL: Duration = Duration::from_secs(30 * 60);

/// Period of the background cleaner
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(60);

/// Errors that can occur in the store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not find state store value for key {0}")]
    NotFound(String),

    #[error("Bucket timestamp out of range: {0}")]
    TimestampOutOfRange(i64),

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Store configuration, fixed for the lifetime of a store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root of the output tree
    pub data_dir: PathBuf,
    /// Width of one bucket
    pub bucket_duration: Duration,
    /// Dedup entry lifetime
    pub dedup_ttl: Duration,
    /// Cleaner period
    pub clean_interval: Duration,
}

impl StoreConfig {
    /// Default durations rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bucket_duration: BUCKET_DURATION,
            dedup_ttl: DEDUP_TTL,
            clean_interval: CLEAN_INTERVAL,
        }
    }
}

/// Time-bucketed log files plus the dedup cache
#[derive(Debug)]
pub struct BucketedFileStore {
    id: Uuid,
    files: FileCache,
    dedup: DedupCache,
    clean_interval: Duration,
}

impl BucketedFileStore {
    /// Create a store with a fresh instance id
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        Self::with_id(config, Uuid::new_v4())
    }

    /// Create a store with an explicit instance id
    pub fn with_id(config: StoreConfig, id: Uuid) -> Result<Self, StoreError> {
        let bucket_secs = config.bucket_duration.as_secs() as i64;
        if bucket_secs <= 0 {
            return Err(StoreError::InvalidConfig(
                "bucket duration must be at least one second".to_string(),
            ));
        }
        if config.clean_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "clean interval must be non-zero".to_string(),
            ));
        }
        let ttl = TimeDelta::from_std(config.dedup_ttl)
            .map_err(|e| StoreError::InvalidConfig(format!("dedup ttl: {e}")))?;

        Ok(Self {
            id,
            files: FileCache::new(config.data_dir, id, bucket_secs),
            dedup: DedupCache::new(ttl),
            clean_interval: config.clean_interval,
        })
    }

    /// Instance id embedded in every filename
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The bucketed file sub-component
    pub fn file_cache(&self) -> &FileCache {
        &self.files
    }

    /// The dedup sub-component
    pub fn dedup_cache(&self) -> &DedupCache {
        &self.dedup
    }

    /// File set for the bucket containing `timestamp`
    pub fn files_for(&self, timestamp: DateTime<Utc>) -> Result<Arc<OutputFileSet>, StoreError> {
        self.files.files_for(timestamp)
    }

    /// When `hash` was first persisted
    pub fn recorded_at(&self, hash: &str) -> Result<DateTime<Utc>, StoreError> {
        self.dedup
            .get(hash)
            .ok_or_else(|| StoreError::NotFound(hash.to_string()))
    }

    /// Record `hash` as persisted at `timestamp`
    pub fn remember(&self, hash: &str, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        self.dedup.insert(hash, timestamp)
    }

    /// One cleaner tick: expire dedup entries, then close stale buckets
    pub fn evict_expired(&self, now: DateTime<Utc>) {
        let hashes = self.dedup.evict(now);
        let buckets = self.files.evict(now);
        if hashes > 0 || buckets > 0 {
            debug!(hashes, buckets, "Evicted expired store entries");
        }
    }

    /// Run the cleaner until `scope` is cancelled, then close every open file
    pub async fn run_cleaner(&self, scope: CancelScope) {
        let mut ticker = interval_at(Instant::now() + self.clean_interval, self.clean_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = ticker.tick() => self.evict_expired(Utc::now()),
            }
        }

        self.files.close_all();
        info!(store = %self.id, "Store cleaner stopped");
    }

    /// Spawn [`Self::run_cleaner`] on the runtime
    pub fn spawn_cleaner(self: &Arc<Self>, scope: CancelScope) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move { store.run_cleaner(scope).await })
    }
}
