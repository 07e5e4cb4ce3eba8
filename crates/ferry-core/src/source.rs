//! Migration source and entity importer contracts
//!
//! The orchestration engine does not know how records are read or written.
//! Legacy-platform connectors implement these traits; the engine only decides
//! which importer runs, when, and with which configuration.

use crate::error::ImportError;
use crate::output::{OutputSink, ProgressSink};
use crate::result::RunResult;
use crate::types::{DependencyEdge, RunConfig};
use indexmap::IndexMap;
use std::sync::Arc;

/// Importer for one entity
///
/// Implement this trait to define how one entity's records move from the
/// legacy platform into the new store.
#[async_trait::async_trait]
pub trait EntityImporter: Send + Sync {
    /// Entity name this importer handles
    fn name(&self) -> &str;

    /// Attach the run configuration before any other call of the run
    fn set_config(&self, config: Arc<RunConfig>);

    /// Declared pre/post dependencies
    fn dependencies(&self) -> Vec<DependencyEdge>;

    /// Number of source records, used to size parallel runs
    async fn total_records(&self) -> Result<u64, ImportError>;

    /// Whether a previous full run finished this entity
    async fn is_completed(&self) -> Result<bool, ImportError>;

    /// Persist that a full run finished this entity
    async fn mark_completed(&self) -> Result<(), ImportError>;

    /// Migrate records, returning how many were processed
    ///
    /// Per-record failures are reported through `result`, not as errors. An
    /// error aborts the whole run.
    async fn import(
        &self,
        result: &RunResult,
        output: &dyn OutputSink,
        progress: &dyn ProgressSink,
    ) -> Result<u64, ImportError>;
}

/// A legacy platform exposing one importer per entity
#[async_trait::async_trait]
pub trait MigrationSource: Send + Sync {
    /// Source name, as given on the command line
    fn name(&self) -> &str;

    /// Connection identifier of the legacy platform
    fn connection(&self) -> &str;

    /// Turn off per-query logging on the connection for the run
    fn disable_query_log(&self) {}

    /// Importer for `name`, if the source knows the entity
    fn importer(&self, name: &str) -> Option<Arc<dyn EntityImporter>>;

    /// All importers keyed by entity name
    fn importers(&self) -> IndexMap<String, Arc<dyn EntityImporter>>;

    /// Release connections and temporary state
    async fn cleanup(&self) -> Result<(), ImportError>;
}
