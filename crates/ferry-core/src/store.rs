//! Detail-record stores
//!
//! Large runs do not keep every migrated row in memory on the result object.
//! Instead each record snapshot is appended to a list stored under
//! `<run-prefix>:<outcome>:<entity>`, and lists expire after a retention window.
//!
//! [`JsonLinesRecordStore`] keeps lists on disk so they outlive the process and
//! can be shared by the worker processes of one run. [`MokaRecordStore`] keeps
//! them in memory for embedding and tests.

use crate::error::StoreError;
use moka::future::Cache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;

/// Retention window for detail records (7 days)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default maximum number of record lists held
pub const DEFAULT_CAPACITY: u64 = 10_000;

const RECORD_EXTENSION: &str = "jsonl";

/// Append-only store for record snapshots
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync + Debug {
    /// Append a record to the list under `key`
    async fn append(&self, key: &str, record: Value) -> Result<(), StoreError>;

    /// Read the list under `key`, empty when absent or expired
    async fn list(&self, key: &str) -> Result<Vec<Value>, StoreError>;

    /// Drop every list whose key starts with `prefix`
    async fn purge_prefix(&self, prefix: &str) -> Result<(), StoreError>;
}

type RecordList = Arc<Mutex<Vec<Value>>>;

/// TTL'd record store on top of a moka cache
#[derive(Debug, Clone)]
pub struct MokaRecordStore {
    inner: Cache<String, RecordList>,
}

impl MokaRecordStore {
    /// Create store with default capacity and the 7 day retention window
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_CAPACITY, DEFAULT_RETENTION)
    }

    /// Create store with explicit capacity and retention
    #[must_use]
    pub fn with_retention(max_capacity: u64, retention: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(retention)
                .support_invalidation_closures()
                .build(),
        }
    }

    /// Get approximate number of lists
    #[inline]
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for MokaRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RecordStore for MokaRecordStore {
    async fn append(&self, key: &str, record: Value) -> Result<(), StoreError> {
        let list = self
            .inner
            .get_with(key.to_string(), async { Arc::new(Mutex::new(Vec::new())) })
            .await;
        list.lock().push(record);
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        Ok(match self.inner.get(key).await {
            Some(list) => list.lock().clone(),
            None => Vec::new(),
        })
    }

    async fn purge_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let prefix = format!("{prefix}:");
        self.inner
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix))
            .map_err(|e| StoreError::Invalidation(e.to_string()))?;
        self.inner.run_pending_tasks().await;
        Ok(())
    }
}

/// Record store writing JSON-lines files below a root directory
///
/// A key `a:b:c` maps to the directory `root/a/b/c`. Each process appends to
/// its own `<pid>.jsonl` there, so the workers of one run never interleave
/// partial lines. Files older than the retention window are ignored on read
/// and removed by [`JsonLinesRecordStore::purge_expired`].
#[derive(Debug)]
pub struct JsonLinesRecordStore {
    root: PathBuf,
    retention: Duration,
    files: tokio::sync::Mutex<HashMap<PathBuf, tokio::fs::File>>,
}

impl JsonLinesRecordStore {
    /// Create store under `root` with the 7 day retention window
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_retention(root, DEFAULT_RETENTION)
    }

    #[must_use]
    pub fn with_retention(root: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            root: root.into(),
            retention,
            files: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the list under `key`
    #[must_use]
    pub fn dir_for(&self, key: &str) -> PathBuf {
        key.split(':')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |dir, segment| dir.join(path_segment(segment)))
    }

    fn is_expired(&self, modified: SystemTime) -> bool {
        modified
            .elapsed()
            .is_ok_and(|age| age > self.retention)
    }

    /// Remove record files older than the retention window
    ///
    /// Directories left empty are removed too. Returns the number of files
    /// removed.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the tree cannot be walked.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let root = self.root.clone();
        let retention = self.retention;
        let removed = tokio::task::spawn_blocking(move || prune(&root, retention))
            .await
            .map_err(io::Error::other)??;
        if removed.files > 0 {
            tracing::debug!(root = %self.root.display(), files = removed.files, "expired records purged");
        }
        Ok(removed.files)
    }
}

#[async_trait::async_trait]
impl RecordStore for JsonLinesRecordStore {
    async fn append(&self, key: &str, record: Value) -> Result<(), StoreError> {
        let dir = self.dir_for(key);
        let path = dir.join(format!("{}.{RECORD_EXTENSION}", std::process::id()));
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut files = self.files.lock().await;
        let file = match files.entry(path) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                tokio::fs::create_dir_all(&dir).await?;
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(entry.key())
                    .await?;
                entry.insert(file)
            }
        };
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        let dir = self.dir_for(key);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if self.is_expired(entry.metadata().await?.modified()?) {
                continue;
            }
            paths.push(path);
        }
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            let text = tokio::fs::read_to_string(&path).await?;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                records.push(serde_json::from_str(line)?);
            }
        }
        Ok(records)
    }

    async fn purge_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let dir = self.dir_for(prefix);
        self.files.lock().await.retain(|path, _| !path.starts_with(&dir));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Key segment as a single path component
fn path_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

struct Pruned {
    files: usize,
    empty: bool,
}

fn prune(dir: &Path, retention: Duration) -> io::Result<Pruned> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Pruned { files: 0, empty: false }),
        Err(e) => return Err(e),
    };

    let mut pruned = Pruned { files: 0, empty: true };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            let inner = prune(&path, retention)?;
            pruned.files += inner.files;
            if inner.empty {
                std::fs::remove_dir(&path)?;
            } else {
                pruned.empty = false;
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
            && meta.modified()?.elapsed().is_ok_and(|age| age > retention)
        {
            std::fs::remove_file(&path)?;
            pruned.files += 1;
        } else {
            pruned.empty = false;
        }
    }
    Ok(pruned)
}
