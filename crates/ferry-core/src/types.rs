//! Core types for Ferry
//!
//! Defines the fundamental data types of a migration run:
//! - Dependency edges declared by importers
//! - Run configuration shared by the orchestrator and the worker pool
//! - Run identifiers used to namespace detail records

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Default number of records fetched per importer batch
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Default number of records handed to one worker process
pub const DEFAULT_MAX_RECORDS_PER_PROCESS: u64 = 10_000;

/// Default number of concurrently running worker processes
pub const DEFAULT_MAX_PROCESSES: usize = 4;

/// Default number of retries for a failed chunk
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// When a dependency must be migrated relative to the declaring entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyPhase {
    /// Migrate the dependency before the declaring entity
    Pre,
    /// Migrate the dependency after the declaring entity
    Post,
}

impl std::fmt::Display for DependencyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => f.write_str("pre"),
            Self::Post => f.write_str("post"),
        }
    }
}

/// Declaration that one entity depends on another
///
/// Edges are immutable once constructed. Required edges are always followed;
/// optional edges only when the run activates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    entity: String,
    phase: DependencyPhase,
    #[serde(default = "default_required")]
    required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

fn default_required() -> bool {
    true
}

impl DependencyEdge {
    /// Create new dependency edge
    #[inline]
    #[must_use]
    pub fn new(entity: impl Into<String>, phase: DependencyPhase, required: bool) -> Self {
        Self {
            entity: entity.into(),
            phase,
            required,
            description: None,
        }
    }

    /// Required dependency migrated before the declaring entity
    #[inline]
    #[must_use]
    pub fn required_pre(entity: impl Into<String>) -> Self {
        Self::new(entity, DependencyPhase::Pre, true)
    }

    /// Optional dependency migrated before the declaring entity
    #[inline]
    #[must_use]
    pub fn optional_pre(entity: impl Into<String>) -> Self {
        Self::new(entity, DependencyPhase::Pre, false)
    }

    /// Required dependency migrated after the declaring entity
    #[inline]
    #[must_use]
    pub fn required_post(entity: impl Into<String>) -> Self {
        Self::new(entity, DependencyPhase::Post, true)
    }

    /// Optional dependency migrated after the declaring entity
    #[inline]
    #[must_use]
    pub fn optional_post(entity: impl Into<String>) -> Self {
        Self::new(entity, DependencyPhase::Post, false)
    }

    /// With human-readable description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Name of the entity depended upon
    #[inline]
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    #[inline]
    #[must_use]
    pub fn phase(&self) -> DependencyPhase {
        self.phase
    }

    #[inline]
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    #[inline]
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Configuration for one migration invocation
///
/// Built once from CLI input and shared read-only (`Arc<RunConfig>`) by the
/// orchestrator, the importers and the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Requested entities in the order given by the operator
    pub entities: Vec<String>,
    /// Records fetched per importer batch
    pub batch_size: u64,
    /// Maximum number of records to migrate
    pub limit: Option<u64>,
    /// Offset of the first record to migrate
    pub offset: Option<u64>,
    /// Acting user on the target platform
    pub user_id: Option<u64>,
    /// Read and transform without writing
    pub dry_run: bool,
    /// Reach the legacy platform through an SSH tunnel
    pub use_ssh: bool,
    /// Download attached media files
    pub download_media: bool,
    /// Base URL of the legacy platform, for link rewriting
    pub base_url: Option<String>,
    /// Fan the entity out across worker processes
    pub parallel: bool,
    /// Records handed to one worker process
    pub max_records_per_process: u64,
    /// Concurrently running worker processes
    pub max_processes: usize,
    /// Memory limit passed to worker processes, in MB
    pub memory_limit_mb: Option<u64>,
    /// Retries for a failed chunk
    pub max_retries: u32,
    /// Ignore "already completed" markers
    pub force: bool,
    /// Entities never migrated in this run
    pub excluded: BTreeSet<String>,
    /// Optional dependencies activated for this run
    pub optional: BTreeSet<String>,
}

impl RunConfig {
    /// Create configuration for the given entities
    #[must_use]
    pub fn new<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entities: entities.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// With batch size
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// With record limit
    #[inline]
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// With start offset
    #[inline]
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// With acting user id
    #[inline]
    #[must_use]
    pub fn with_user_id(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// As dry run
    #[inline]
    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// As forced run
    #[inline]
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// With parallel worker settings
    #[inline]
    #[must_use]
    pub fn with_parallelism(mut self, max_processes: usize, max_records_per_process: u64) -> Self {
        self.parallel = true;
        self.max_processes = max_processes;
        self.max_records_per_process = max_records_per_process;
        self
    }

    /// With excluded entities
    #[must_use]
    pub fn with_excluded<I, S>(mut self, excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(excluded.into_iter().map(Into::into));
        self
    }

    /// With activated optional dependencies
    #[must_use]
    pub fn with_optional<I, S>(mut self, optional: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional.extend(optional.into_iter().map(Into::into));
        self
    }

    /// A run restricted by limit or offset
    #[inline]
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// Only full runs may mark an entity completed
    #[inline]
    #[must_use]
    pub fn is_full_run(&self) -> bool {
        !self.is_partial() && !self.dry_run
    }

    #[inline]
    #[must_use]
    pub fn is_excluded(&self, entity: &str) -> bool {
        self.excluded.contains(entity)
    }

    /// Whether an edge is followed in this run
    #[inline]
    #[must_use]
    pub fn follows(&self, edge: &DependencyEdge) -> bool {
        edge.is_required() || self.optional.contains(edge.entity())
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` for zero sizes and
    /// `ConfigError::NoEntities` when nothing was requested.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entities.is_empty() {
            return Err(ConfigError::NoEntities);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be greater than zero"));
        }
        if self.max_processes == 0 {
            return Err(ConfigError::invalid("max_processes", "must be greater than zero"));
        }
        if self.max_records_per_process == 0 {
            return Err(ConfigError::invalid(
                "max_records_per_process",
                "must be greater than zero",
            ));
        }
        if self.parallel && self.entities.len() != 1 {
            return Err(ConfigError::invalid(
                "entities",
                "parallel runs migrate exactly one entity",
            ));
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            limit: None,
            offset: None,
            user_id: None,
            dry_run: false,
            use_ssh: false,
            download_media: false,
            base_url: None,
            parallel: false,
            max_records_per_process: DEFAULT_MAX_RECORDS_PER_PROCESS,
            max_processes: DEFAULT_MAX_PROCESSES,
            memory_limit_mb: None,
            max_retries: DEFAULT_MAX_RETRIES,
            force: false,
            excluded: BTreeSet::new(),
            optional: BTreeSet::new(),
        }
    }
}

/// Unique run identifier, used as the detail-record namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Cache key prefix for this run's detail records
    #[must_use]
    pub fn cache_prefix(&self) -> String {
        format!("migration:{}", self.0.simple())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}
