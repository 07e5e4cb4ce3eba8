//! Ferry Pool - parallel migration through worker processes
//!
//! Splits one entity's record range into chunks and migrates each chunk in a
//! separate worker process:
//! - At most `max_processes` workers run at once
//! - Failed chunks are rerun up to `max_retries` times
//! - Worker output is interleaved with per-worker tags and colors
//! - A shutdown request stops every worker (SIGTERM, then SIGKILL)
//!
//! # Example
//!
//! ```rust,ignore
//! use ferry_pool::{PoolSettings, ProcessLauncher, WorkerPoolScheduler};
//! use std::sync::Arc;
//!
//! let launcher = ProcessLauncher::current_exe("legacy", Arc::clone(&config))?
//!     .with_leading_args(["migrate"]);
//! let mut pool = WorkerPoolScheduler::new(
//!     PoolSettings::from_config(&config),
//!     Arc::new(launcher),
//!     Arc::new(ConsoleOutput),
//! );
//! let ok = pool.migrate("users", 250_000).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod chunk;
pub mod error;
pub mod launcher;
pub mod multiplex;
pub mod scheduler;

pub use chunk::{Chunk, ChunkKey, ChunkPlanner};
pub use error::PoolError;
pub use launcher::{
    worker_args, EventSender, ProcessLauncher, StreamKind, WorkerEvent, WorkerHandle, WorkerId,
    WorkerLauncher, OUTPUT_DRAIN_TIMEOUT,
};
pub use multiplex::{classify, Color, ColorPalette, LineClass, OutputMultiplexer};
pub use scheduler::{
    range_end, ChunkFailure, CompletedChunk, PoolSettings, WorkerPoolScheduler,
    DEFAULT_TERMINATION_GRACE,
};
