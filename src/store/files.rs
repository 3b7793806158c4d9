//! Bucketed output files.
//!
//! Maps a bucket key to the pair of append-only CSV files for that window.
//! Only this module touches the file map lock.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::StoreError;

/// Subdirectory of the transaction log
pub const TRANSACTIONS_DIR: &str = "transactions";

/// Subdirectory of the source log
pub const SOURCELOG_DIR: &str = "sourcelog";

/// Start of the bucket containing `timestamp_secs`
pub fn bucket_key(timestamp_secs: i64, bucket_secs: i64) -> i64 {
    timestamp_secs.div_euclid(bucket_secs) * bucket_secs
}

/// The two open log files of one bucket
#[derive(Debug)]
pub struct OutputFileSet {
    bucket: i64,
    source_log: File,
    source_path: PathBuf,
    tx_log: File,
    tx_path: PathBuf,
}

impl OutputFileSet {
    /// Bucket key (epoch seconds) this set belongs to
    pub fn bucket(&self) -> i64 {
        self.bucket
    }

    pub fn source_log_path(&self) -> &Path {
        &self.source_path
    }

    pub fn transaction_log_path(&self) -> &Path {
        &self.tx_path
    }

    /// Append one line to the source log
    pub fn append_source(&self, line: &str) -> Result<(), StoreError> {
        (&self.source_log)
            .write_all(line.as_bytes())
            .map_err(|e| StoreError::io(&self.source_path, e))
    }

    /// Append one line to the transaction log
    pub fn append_transaction(&self, line: &str) -> Result<(), StoreError> {
        (&self.tx_log)
            .write_all(line.as_bytes())
            .map_err(|e| StoreError::io(&self.tx_path, e))
    }

    /// Flush both files to disk. The handles close when the last reference drops.
    pub fn close(&self) {
        for (file, path) in [(&self.tx_log, &self.tx_path), (&self.source_log, &self.source_path)] {
            if let Err(e) = file.sync_all() {
                warn!("Failed to flush {}: {}", path.display(), e);
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))
}

/// Lazily opened file sets, one per bucket key
#[derive(Debug)]
pub struct FileCache {
    data_dir: PathBuf,
    store_id: Uuid,
    bucket_secs: i64,
    files: RwLock<HashMap<i64, Arc<OutputFileSet>>>,
}

impl FileCache {
    pub fn new(data_dir: PathBuf, store_id: Uuid, bucket_secs: i64) -> Self {
        Self {
            data_dir,
            store_id,
            bucket_secs,
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn bucket_secs(&self) -> i64 {
        self.bucket_secs
    }

    /// `<prefix>_<YYYY-MM-DD_HH-MM>_<store id>.csv`
    pub fn filename(&self, prefix: &str, start: &DateTime<Utc>) -> String {
        format!(
            "{}_{}_{}.csv",
            prefix,
            start.format("%Y-%m-%d_%H-%M"),
            self.store_id
        )
    }

    /// File set for the bucket containing `timestamp`, opened on first use
    pub fn files_for(&self, timestamp: DateTime<Utc>) -> Result<Arc<OutputFileSet>, StoreError> {
        let key = bucket_key(timestamp.timestamp(), self.bucket_secs);

        if let Some(files) = self.files.read().get(&key) {
            return Ok(Arc::clone(files));
        }

        // Re-check under the write lock so only one task creates the files
        let mut files = self.files.write();
        if let Some(existing) = files.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let opened = Arc::new(self.open(key)?);
        files.insert(key, Arc::clone(&opened));
        debug!(bucket = key, "Opened bucket files");
        Ok(opened)
    }

    fn open(&self, key: i64) -> Result<OutputFileSet, StoreError> {
        let start = DateTime::from_timestamp(key, 0).ok_or(StoreError::TimestampOutOfRange(key))?;
        let day = self.data_dir.join(start.format("%Y-%m-%d").to_string());

        let tx_dir = day.join(TRANSACTIONS_DIR);
        fs::create_dir_all(&tx_dir).map_err(|e| StoreError::io(&tx_dir, e))?;
        let tx_path = tx_dir.join(self.filename("txs", &start));
        let tx_log = open_append(&tx_path)?;

        let source_dir = day.join(SOURCELOG_DIR);
        fs::create_dir_all(&source_dir).map_err(|e| StoreError::io(&source_dir, e))?;
        let source_path = source_dir.join(self.filename("src", &start));
        let source_log = open_append(&source_path)?;

        Ok(OutputFileSet {
            bucket: key,
            source_log,
            source_path,
            tx_log,
            tx_path,
        })
    }

    /// Whether a set for `key` is currently tracked
    pub fn is_tracked(&self, key: i64) -> bool {
        self.files.read().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    /// Close and drop every set older than twice the bucket duration
    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let max_age = self.bucket_secs * 2;
        let now = now.timestamp();

        let expired: Vec<Arc<OutputFileSet>> = {
            let mut files = self.files.write();
            let keys: Vec<i64> = files
                .keys()
                .copied()
                .filter(|key| now - key > max_age)
                .collect();
            keys.iter().filter_map(|key| files.remove(key)).collect()
        };

        // Flush after releasing the map lock
        for set in &expired {
            set.close();
        }
        expired.len()
    }

    /// Close and drop every tracked set
    pub fn close_all(&self) {
        let drained: Vec<Arc<OutputFileSet>> = self.files.write().drain().map(|(_, set)| set).collect();
        for set in &drained {
            set.close();
        }
    }
}
