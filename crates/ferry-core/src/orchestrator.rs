//! Dependency-ordered entity orchestration
//!
//! Given the requested entities, the orchestrator:
//! - Pulls in declared dependencies before (pre) or after (post) each entity
//! - Honors exclusions and optional-dependency activation
//! - Skips entities a previous full run already completed
//! - Migrates every entity at most once per run

use crate::error::{ConfigError, MigrateError};
use crate::output::{OutputSink, ProgressSink};
use crate::result::RunResult;
use crate::source::{EntityImporter, MigrationSource};
use crate::store::RecordStore;
use crate::types::{DependencyEdge, DependencyPhase, RunConfig};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Pending work on the traversal stack
enum Frame {
    /// Resolve an entity and schedule its pre dependencies
    Enter(String),
    /// Pre dependencies are done: migrate the entity, then its post dependencies
    Finish {
        entity: String,
        importer: Arc<dyn EntityImporter>,
        post: Vec<DependencyEdge>,
    },
}

/// Visit bookkeeping shared by all top-level entities of one run
#[derive(Debug, Default)]
struct Traversal {
    visited: HashSet<String>,
    in_progress: HashSet<String>,
}

impl Traversal {
    fn seen(&self, entity: &str) -> bool {
        self.visited.contains(entity) || self.in_progress.contains(entity)
    }
}

/// Migrates requested entities in dependency order
///
/// A run configuration and both output sinks must be attached before
/// [`migrate`](Self::migrate) is called.
#[derive(Default)]
pub struct DependencyOrchestrator {
    config: Option<Arc<RunConfig>>,
    output: Option<Arc<dyn OutputSink>>,
    progress: Option<Arc<dyn ProgressSink>>,
    store: Option<Arc<dyn RecordStore>>,
}

impl std::fmt::Debug for DependencyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyOrchestrator")
            .field("config", &self.config)
            .field("has_output", &self.output.is_some())
            .field("has_progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

impl DependencyOrchestrator {
    /// Create orchestrator with nothing attached
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With run configuration
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: Arc<RunConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// With output sink
    #[inline]
    #[must_use]
    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = Some(output);
        self
    }

    /// With progress sink
    #[inline]
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// With detail-record store shared across runs
    #[inline]
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Get configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> Option<&RunConfig> {
        self.config.as_deref()
    }

    /// Migrate every requested entity and its active dependencies
    ///
    /// # Errors
    /// - `MigrateError::Config` if configuration or sinks are missing
    /// - `MigrateError::UnknownEntity` if a reached entity has no importer
    /// - `MigrateError::Import` if an importer fails; counters gathered so far
    ///   are not rolled back
    pub async fn migrate(&self, source: &dyn MigrationSource) -> Result<RunResult, MigrateError> {
        let config = self.config.clone().ok_or(ConfigError::MissingRunConfig)?;
        let output = self.output.as_deref().ok_or(ConfigError::MissingSink("output"))?;
        let progress = self
            .progress
            .as_deref()
            .ok_or(ConfigError::MissingSink("progress"))?;

        tracing::info!(
            source = source.name(),
            entities = ?config.entities,
            full_run = config.is_full_run(),
            "starting migration"
        );
        tracing::debug!(connection = source.connection(), "disabling query log");
        source.disable_query_log();

        let result = match &self.store {
            Some(store) => RunResult::with_store(Arc::clone(store)),
            None => RunResult::new(),
        };

        let mut traversal = Traversal::default();
        for entity in &config.entities {
            self.migrate_entity_with_dependencies(
                source,
                entity,
                &config,
                &result,
                output,
                progress,
                &mut traversal,
            )
            .await?;
        }

        tracing::info!(entities = traversal.visited.len(), "migration finished");
        Ok(result)
    }

    /// Depth-first walk from one requested entity
    ///
    /// Uses an explicit stack so long dependency chains do not grow the call
    /// stack. Per entity the order is pre dependencies, the entity, then post
    /// dependencies.
    #[allow(clippy::too_many_arguments)]
    async fn migrate_entity_with_dependencies(
        &self,
        source: &dyn MigrationSource,
        entity: &str,
        config: &Arc<RunConfig>,
        result: &RunResult,
        output: &dyn OutputSink,
        progress: &dyn ProgressSink,
        traversal: &mut Traversal,
    ) -> Result<(), MigrateError> {
        let mut stack = vec![Frame::Enter(entity.to_string())];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(entity) => {
                    if traversal.seen(&entity) {
                        continue;
                    }

                    if config.is_excluded(&entity) {
                        tracing::info!(entity = %entity, "skipping excluded entity");
                        output.write_line(&format!("Skipping {entity}: excluded"));
                        traversal.visited.insert(entity);
                        continue;
                    }

                    let importer = source
                        .importer(&entity)
                        .ok_or_else(|| MigrateError::UnknownEntity(entity.clone()))?;
                    importer.set_config(Arc::clone(config));

                    if !config.force {
                        let completed = importer
                            .is_completed()
                            .await
                            .map_err(|e| MigrateError::import(&entity, e))?;
                        if completed {
                            tracing::info!(entity = %entity, "skipping completed entity");
                            output.write_line(&format!("Skipping {entity}: already completed"));
                            traversal.visited.insert(entity);
                            continue;
                        }
                    }

                    let (pre, post) = partition_active(&entity, importer.dependencies(), config);
                    traversal.in_progress.insert(entity.clone());
                    stack.push(Frame::Finish {
                        entity,
                        importer,
                        post,
                    });
                    for edge in pre.iter().rev() {
                        stack.push(Frame::Enter(edge.entity().to_string()));
                    }
                }
                Frame::Finish {
                    entity,
                    importer,
                    post,
                } => {
                    migrate_entity(&entity, importer.as_ref(), config, result, output, progress)
                        .await?;
                    traversal.in_progress.remove(&entity);
                    traversal.visited.insert(entity);
                    for edge in post.iter().rev() {
                        stack.push(Frame::Enter(edge.entity().to_string()));
                    }
                }
            }
        }

        Ok(())
    }

    /// Optional dependencies an operator could activate
    ///
    /// Covers one importer when `entity` is given, otherwise all importers.
    /// Excluded entities are left out.
    ///
    /// # Errors
    /// Returns `MigrateError::UnknownEntity` if `entity` has no importer.
    pub fn optional_dependencies(
        &self,
        source: &dyn MigrationSource,
        entity: Option<&str>,
    ) -> Result<IndexMap<String, DependencyEdge>, MigrateError> {
        let importers: Vec<Arc<dyn EntityImporter>> = match entity {
            Some(name) => vec![source
                .importer(name)
                .ok_or_else(|| MigrateError::UnknownEntity(name.to_string()))?],
            None => source.importers().into_values().collect(),
        };

        let mut optional = IndexMap::new();
        for importer in importers {
            for edge in importer.dependencies() {
                let excluded = self
                    .config
                    .as_ref()
                    .is_some_and(|c| c.is_excluded(edge.entity()));
                if !edge.is_required() && !excluded {
                    optional.entry(edge.entity().to_string()).or_insert(edge);
                }
            }
        }
        Ok(optional)
    }
}

/// Split followed edges into pre and post lists, preserving declaration order
fn partition_active(
    entity: &str,
    edges: Vec<DependencyEdge>,
    config: &RunConfig,
) -> (Vec<DependencyEdge>, Vec<DependencyEdge>) {
    let (active, inactive): (Vec<_>, Vec<_>) = edges.into_iter().partition(|e| config.follows(e));
    for edge in &inactive {
        tracing::debug!(entity, dependency = edge.entity(), "optional dependency not activated");
    }
    active
        .into_iter()
        .partition(|e| e.phase() == DependencyPhase::Pre)
}

async fn migrate_entity(
    entity: &str,
    importer: &dyn EntityImporter,
    config: &RunConfig,
    result: &RunResult,
    output: &dyn OutputSink,
    progress: &dyn ProgressSink,
) -> Result<(), MigrateError> {
    tracing::info!(entity, "migrating entity");
    result.add_entity(entity);
    output.write_line(&format!("Migrating {entity}..."));

    let processed = importer
        .import(result, output, progress)
        .await
        .map_err(|e| MigrateError::import(entity, e))?;

    if config.is_full_run() {
        importer
            .mark_completed()
            .await
            .map_err(|e| MigrateError::import(entity, e))?;
    }

    tracing::info!(entity, processed, "entity migrated");
    output.write_line(&format!("Migrated {entity}: {processed} records processed"));
    Ok(())
}
