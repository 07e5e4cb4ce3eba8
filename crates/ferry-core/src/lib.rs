//! Ferry Core - migration orchestration engine
//!
//! The part of a platform migration that decides what runs:
//! - Run configuration shared by every component of a run
//! - Dependency-ordered traversal of requested entities
//! - Result accounting with TTL'd detail records, in memory or on disk
//! - The contracts legacy-platform connectors implement
//!
//! # Example
//!
//! ```rust,ignore
//! use ferry_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(source: &dyn MigrationSource) -> Result<(), MigrateError> {
//! let config = RunConfig::new(["orders"]).with_batch_size(500);
//! let orchestrator = DependencyOrchestrator::new()
//!     .with_config(Arc::new(config))
//!     .with_output(Arc::new(ConsoleOutput))
//!     .with_progress(Arc::new(ConsoleProgress::new()));
//!
//! let result = orchestrator.migrate(source).await?;
//! println!("migrated {} records", result.totals().migrated);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod result;
pub mod source;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use error::{ConfigError, ImportError, MigrateError, StoreError};
pub use orchestrator::DependencyOrchestrator;
pub use output::{
    render_bar, render_table, ConsoleOutput, ConsoleProgress, NullProgress, OutputSink,
    ProgressSink,
};
pub use result::{EntityCounts, Outcome, RunResult, TableRow, TALLY_MARKER};
pub use source::{EntityImporter, MigrationSource};
pub use store::{JsonLinesRecordStore, MokaRecordStore, RecordStore, DEFAULT_RETENTION};
pub use types::{DependencyEdge, DependencyPhase, RunConfig, RunId};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Ferry core
    pub use crate::{
        ConsoleOutput, ConsoleProgress, DependencyEdge, DependencyOrchestrator, EntityImporter,
        MigrateError, MigrationSource, OutputSink, ProgressSink, RunConfig, RunResult,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
