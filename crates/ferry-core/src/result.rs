//! Run result accounting
//!
//! `RunResult` holds per-entity counters in memory and appends the detailed
//! record snapshots to a [`RecordStore`] under a run-scoped prefix.

use crate::error::StoreError;
use crate::store::{MokaRecordStore, RecordStore};
use crate::types::RunId;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Marker opening a machine-readable tally line on a worker's stdout
pub const TALLY_MARKER: &str = "ferry:tally ";

/// Outcome of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Migrated,
    Skipped,
    Failed,
}

impl Outcome {
    /// Key segment for this outcome
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Migrated => "migrated",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Counters for one entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub migrated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl EntityCounts {
    /// Sum of all outcomes
    #[inline]
    #[must_use]
    pub fn total(&self) -> u64 {
        self.migrated + self.skipped + self.failed
    }
}

/// One reporting row: `(entity, migrated, skipped, failed)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub entity: String,
    pub migrated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl TableRow {
    /// Row as a tally line a parent process can parse
    #[must_use]
    pub fn to_tally_line(&self) -> String {
        // A struct of strings and integers always serializes
        format!("{TALLY_MARKER}{}", serde_json::to_string(self).unwrap_or_default())
    }

    /// Parse a line written by [`TableRow::to_tally_line`]
    #[must_use]
    pub fn from_tally_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim().strip_prefix(TALLY_MARKER.trim_end())?.trim()).ok()
    }
}

/// Accumulated result of one migration run
///
/// Counters only ever grow within a run and record lists are append-only.
/// The object is shared by reference with every importer, so updates go
/// through an internal mutex.
#[derive(Debug)]
pub struct RunResult {
    run_id: RunId,
    prefix: String,
    counts: Mutex<IndexMap<String, EntityCounts>>,
    store: Arc<dyn RecordStore>,
}

impl RunResult {
    /// Create result backed by a fresh moka store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(MokaRecordStore::new()))
    }

    /// Create result backed by the given store
    #[must_use]
    pub fn with_store(store: Arc<dyn RecordStore>) -> Self {
        Self::with_run_id(RunId::new(), store)
    }

    /// Create result recording under an existing run's prefix
    ///
    /// Worker processes use this to add their records to the parent's run.
    #[must_use]
    pub fn with_run_id(run_id: RunId, store: Arc<dyn RecordStore>) -> Self {
        Self {
            run_id,
            prefix: run_id.cache_prefix(),
            counts: Mutex::new(IndexMap::new()),
            store,
        }
    }

    #[inline]
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Namespace of this run's detail records
    #[inline]
    #[must_use]
    pub fn cache_prefix(&self) -> &str {
        &self.prefix
    }

    /// Register an entity with zeroed counters
    pub fn add_entity(&self, entity: &str) {
        self.counts.lock().entry(entity.to_string()).or_default();
    }

    pub fn increment_migrated(&self, entity: &str, by: u64) {
        self.update(entity, |c| c.migrated += by);
    }

    pub fn increment_skipped(&self, entity: &str, by: u64) {
        self.update(entity, |c| c.skipped += by);
    }

    pub fn increment_failed(&self, entity: &str, by: u64) {
        self.update(entity, |c| c.failed += by);
    }

    fn update(&self, entity: &str, f: impl FnOnce(&mut EntityCounts)) {
        let mut counts = self.counts.lock();
        f(counts.entry(entity.to_string()).or_default());
    }

    /// Counters for one entity, if touched
    #[must_use]
    pub fn counts(&self, entity: &str) -> Option<EntityCounts> {
        self.counts.lock().get(entity).copied()
    }

    /// Entities in first-touch order
    #[must_use]
    pub fn entities(&self) -> Vec<String> {
        self.counts.lock().keys().cloned().collect()
    }

    /// Append a migrated record snapshot
    ///
    /// # Errors
    /// Returns `StoreError::Snapshot` if the record cannot be serialized.
    pub async fn record_migrated<T: Serialize + ?Sized>(
        &self,
        entity: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        self.record(Outcome::Migrated, entity, record).await
    }

    /// Append a skipped record snapshot
    ///
    /// # Errors
    /// Returns `StoreError::Snapshot` if the record cannot be serialized.
    pub async fn record_skipped<T: Serialize + ?Sized>(
        &self,
        entity: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        self.record(Outcome::Skipped, entity, record).await
    }

    /// Append a failed record snapshot
    ///
    /// # Errors
    /// Returns `StoreError::Snapshot` if the record cannot be serialized.
    pub async fn record_failed<T: Serialize + ?Sized>(
        &self,
        entity: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        self.record(Outcome::Failed, entity, record).await
    }

    async fn record<T: Serialize + ?Sized>(
        &self,
        outcome: Outcome,
        entity: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        let snapshot = serde_json::to_value(record)?;
        self.store.append(&self.key(outcome, entity), snapshot).await
    }

    /// Detail records of one entity and outcome
    ///
    /// # Errors
    /// Returns the store's error if the list cannot be read.
    pub async fn records(&self, entity: &str, outcome: Outcome) -> Result<Vec<Value>, StoreError> {
        self.store.list(&self.key(outcome, entity)).await
    }

    fn key(&self, outcome: Outcome, entity: &str) -> String {
        format!("{}:{}:{}", self.prefix, outcome.as_str(), entity)
    }

    /// Flatten counters for reporting
    #[must_use]
    pub fn to_table_rows(&self) -> Vec<TableRow> {
        self.counts
            .lock()
            .iter()
            .map(|(entity, c)| TableRow {
                entity: entity.clone(),
                migrated: c.migrated,
                skipped: c.skipped,
                failed: c.failed,
            })
            .collect()
    }

    /// Add a row's counts, typically a worker's tally
    pub fn absorb(&self, row: &TableRow) {
        self.update(&row.entity, |c| {
            c.migrated += row.migrated;
            c.skipped += row.skipped;
            c.failed += row.failed;
        });
    }

    /// One tally line per entity
    #[must_use]
    pub fn tally_lines(&self) -> Vec<String> {
        self.to_table_rows().iter().map(TableRow::to_tally_line).collect()
    }

    /// Sum over all entities
    #[must_use]
    pub fn totals(&self) -> EntityCounts {
        self.counts
            .lock()
            .values()
            .fold(EntityCounts::default(), |acc, c| EntityCounts {
                migrated: acc.migrated + c.migrated,
                skipped: acc.skipped + c.skipped,
                failed: acc.failed + c.failed,
            })
    }

    /// Purge this run's detail records
    ///
    /// Only keys under this run's prefix are dropped, so concurrent runs
    /// sharing a store keep their records.
    ///
    /// # Errors
    /// Returns `StoreError::Invalidation` if the store rejects the purge.
    pub async fn cleanup(&self) -> Result<(), StoreError> {
        tracing::debug!(prefix = %self.prefix, "purging run detail records");
        self.store.purge_prefix(&self.prefix).await
    }
}

impl Default for RunResult {
    fn default() -> Self {
        Self::new()
    }
}
