//! Error types for Ferry core
//!
//! Provides error handling for:
//! - Run configuration mistakes (fatal, abort the run)
//! - Unknown entity names
//! - Importer failures (propagate and abort the run)
//! - Detail-record store failures

/// Main orchestration error type
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Entity has no importer in the source
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// Importer failed
    #[error("import of {entity} failed: {source}")]
    Import {
        /// Entity being imported
        entity: String,
        /// The importer's error
        #[source]
        source: ImportError,
    },

    /// Detail-record store failed
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

impl MigrateError {
    /// Operator or programmer mistake rather than a data problem
    #[inline]
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::UnknownEntity(_))
    }

    /// Wrap an importer error with the entity it came from
    #[inline]
    pub fn import(entity: impl Into<String>, source: ImportError) -> Self {
        Self::Import {
            entity: entity.into(),
            source,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Orchestrator used before a run configuration was attached
    #[error("no run configuration attached")]
    MissingRunConfig,

    /// Orchestrator used before output sinks were attached
    #[error("no {0} sink attached")]
    MissingSink(&'static str),

    /// Nothing requested
    #[error("no entities requested")]
    NoEntities,

    /// Invalid value
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Settings or manifest file could not be read or parsed
    #[error("failed to load {path}: {reason}")]
    Load { path: String, reason: String },
}

impl ConfigError {
    /// Create load error
    #[inline]
    pub fn load(path: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Self::Load {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create invalid value error
    #[inline]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by entity importers
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// Legacy platform could not be read
    #[error("source unavailable: {0}")]
    Source(String),

    /// Target store rejected the write
    #[error("target rejected write: {0}")]
    Target(String),

    /// Completion marker could not be read or written
    #[error("completion state error: {0}")]
    State(String),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Record store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Detail-record store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record could not be snapshotted
    #[error("record snapshot failed: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// Backend refused the invalidation request
    #[error("invalidation failed: {0}")]
    Invalidation(String),

    /// Record file could not be read or written
    #[error("record store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
