//! Manifest-backed migration source
//!
//! A TOML manifest stands in for a legacy platform: it names the entities,
//! how many records each holds, their dependency edges, and which record ids
//! fail or are skipped. Completion markers are JSON files in a state
//! directory, one per entity; detail records of each run live next to them
//! under `runs/`.
//!
//! ```toml
//! name = "legacy"
//! connection = "mysql://legacy/app"
//!
//! [entities.users]
//! records = 250
//! failing = [17]
//!
//! [entities.orders]
//! records = 1200
//! dependencies = [{ entity = "users", phase = "pre" }]
//! ```

use async_trait::async_trait;
use ferry_core::{
    ConfigError, DependencyEdge, EntityImporter, ImportError, MigrationSource, OutputSink,
    ProgressSink, RunConfig, RunResult,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Parsed manifest file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub connection: String,
    #[serde(default)]
    pub entities: IndexMap<String, EntityManifest>,
}

/// One entity of a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EntityManifest {
    /// Number of source records; ids run from 1 to `records`
    pub records: u64,
    pub dependencies: Vec<DependencyEdge>,
    /// Ids whose migration fails
    pub failing: BTreeSet<u64>,
    /// Ids that are skipped as already present on the target
    pub skipped: BTreeSet<u64>,
    /// Records carry media files
    pub media: bool,
    /// Pause after each batch, in milliseconds
    pub batch_delay_ms: u64,
    /// Fail the whole import with this message
    pub fail_import: Option<String>,
}

impl Manifest {
    /// Parse a manifest from TOML text
    ///
    /// # Errors
    /// Returns `ConfigError::Load` on malformed TOML.
    pub fn from_toml(text: &str, origin: impl std::fmt::Display) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::load(origin, e))
    }

    /// Read a manifest file
    ///
    /// # Errors
    /// Returns `ConfigError::Load` if the file is unreadable or malformed.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::load(path.display(), e))?;
        Self::from_toml(&text, path.display())
    }
}

/// Completion marker persisted after a full run of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub source: String,
    pub entity: String,
    pub records: u64,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Migration source backed by a [`Manifest`]
#[derive(Debug)]
pub struct ManifestSource {
    name: String,
    connection: String,
    state_dir: PathBuf,
    importers: IndexMap<String, Arc<ManifestImporter>>,
    query_log_enabled: AtomicBool,
}

impl ManifestSource {
    /// Build importers for every manifest entity, keeping markers under
    /// `state_dir/<source name>`
    #[must_use]
    pub fn new(manifest: Manifest, state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into().join(&manifest.name);
        let importers = manifest
            .entities
            .into_iter()
            .map(|(entity, entry)| {
                let importer = ManifestImporter::new(&manifest.name, &entity, entry, &state_dir);
                (entity, Arc::new(importer))
            })
            .collect();

        Self {
            name: manifest.name,
            connection: manifest.connection,
            state_dir,
            importers,
            query_log_enabled: AtomicBool::new(true),
        }
    }

    /// Load the manifest at `path`
    ///
    /// # Errors
    /// Returns `ConfigError::Load` if the manifest cannot be read.
    pub async fn open(path: &Path, state_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let manifest = Manifest::load(path).await?;
        tracing::debug!(
            path = %path.display(),
            source = %manifest.name,
            entities = manifest.entities.len(),
            "manifest loaded"
        );
        Ok(Self::new(manifest, state_dir))
    }

    /// Root of this source's per-run detail records
    #[must_use]
    pub fn records_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    #[must_use]
    pub fn query_log_enabled(&self) -> bool {
        self.query_log_enabled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MigrationSource for ManifestSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection(&self) -> &str {
        &self.connection
    }

    fn disable_query_log(&self) {
        self.query_log_enabled.store(false, Ordering::Relaxed);
    }

    fn importer(&self, name: &str) -> Option<Arc<dyn EntityImporter>> {
        self.importers
            .get(name)
            .map(|i| Arc::clone(i) as Arc<dyn EntityImporter>)
    }

    fn importers(&self) -> IndexMap<String, Arc<dyn EntityImporter>> {
        self.importers
            .iter()
            .map(|(name, i)| (name.clone(), Arc::clone(i) as Arc<dyn EntityImporter>))
            .collect()
    }

    async fn cleanup(&self) -> Result<(), ImportError> {
        tracing::debug!(source = %self.name, "source cleanup");
        self.query_log_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Importer for one manifest entity
#[derive(Debug)]
pub struct ManifestImporter {
    source: String,
    entity: String,
    entry: EntityManifest,
    marker: PathBuf,
    config: Mutex<Arc<RunConfig>>,
}

impl ManifestImporter {
    fn new(source: &str, entity: &str, entry: EntityManifest, state_dir: &Path) -> Self {
        Self {
            source: source.to_string(),
            entity: entity.to_string(),
            entry,
            marker: state_dir.join(format!("{entity}.json")),
            config: Mutex::new(Arc::new(RunConfig::default())),
        }
    }

    /// Path of this entity's completion marker
    #[must_use]
    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    /// Record ids covered by `config`, as a half-open id range
    fn window(&self, config: &RunConfig) -> (u64, u64) {
        let start = config.offset.unwrap_or(0).min(self.entry.records);
        let end = match config.limit {
            Some(limit) => start.saturating_add(limit).min(self.entry.records),
            None => self.entry.records,
        };
        (start + 1, end + 1)
    }

    fn snapshot(&self, id: u64, config: &RunConfig) -> serde_json::Value {
        let mut record = serde_json::json!({ "entity": self.entity, "id": id });
        if let Some(user) = config.user_id {
            record["imported_by"] = user.into();
        }
        if let Some(base) = &config.base_url {
            record["legacy_url"] = format!("{}/{}/{id}", base.trim_end_matches('/'), self.entity).into();
        }
        if self.entry.media && config.download_media {
            record["media_downloaded"] = (!config.dry_run).into();
        }
        record
    }
}

#[async_trait]
impl EntityImporter for ManifestImporter {
    fn name(&self) -> &str {
        &self.entity
    }

    fn set_config(&self, config: Arc<RunConfig>) {
        *self.config.lock() = config;
    }

    fn dependencies(&self) -> Vec<DependencyEdge> {
        self.entry.dependencies.clone()
    }

    async fn total_records(&self) -> Result<u64, ImportError> {
        Ok(self.entry.records)
    }

    async fn is_completed(&self) -> Result<bool, ImportError> {
        Ok(tokio::fs::try_exists(&self.marker).await?)
    }

    async fn mark_completed(&self) -> Result<(), ImportError> {
        if let Some(dir) = self.marker.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let marker = CompletionMarker {
            source: self.source.clone(),
            entity: self.entity.clone(),
            records: self.entry.records,
            completed_at: chrono::Utc::now(),
        };
        tokio::fs::write(&self.marker, serde_json::to_vec_pretty(&marker)?).await?;
        tracing::debug!(entity = %self.entity, path = %self.marker.display(), "completion marker written");
        Ok(())
    }

    async fn import(
        &self,
        result: &RunResult,
        output: &dyn OutputSink,
        progress: &dyn ProgressSink,
    ) -> Result<u64, ImportError> {
        let config = Arc::clone(&self.config.lock());
        if let Some(message) = &self.entry.fail_import {
            return Err(ImportError::Source(message.clone()));
        }

        let (first, end) = self.window(&config);
        let batch = config.batch_size.max(1);
        tracing::debug!(
            entity = %self.entity,
            first,
            end,
            batch,
            dry_run = config.dry_run,
            "importing window"
        );

        progress.start(end - first);
        let mut id = first;
        while id < end {
            let batch_end = id.saturating_add(batch).min(end);
            let (mut migrated, mut skipped, mut failed) = (0, 0, 0);

            for record_id in id..batch_end {
                let snapshot = self.snapshot(record_id, &config);
                if self.entry.failing.contains(&record_id) {
                    output.write_error(&format!("{} #{record_id}: rejected by target", self.entity));
                    result.record_failed(&self.entity, &snapshot).await?;
                    failed += 1;
                } else if self.entry.skipped.contains(&record_id) {
                    result.record_skipped(&self.entity, &snapshot).await?;
                    skipped += 1;
                } else {
                    result.record_migrated(&self.entity, &snapshot).await?;
                    migrated += 1;
                }
            }

            result.increment_migrated(&self.entity, migrated);
            result.increment_skipped(&self.entity, skipped);
            result.increment_failed(&self.entity, failed);
            progress.advance(batch_end - id);

            if self.entry.batch_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.entry.batch_delay_ms)).await;
            } else {
                tokio::task::yield_now().await;
            }
            id = batch_end;
        }
        progress.finish();

        Ok(end - first)
    }
}
