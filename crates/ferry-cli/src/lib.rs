//! Ferry CLI - command-line front end of the migration engine
//!
//! Wires the orchestrator and the worker pool to a manifest-backed source,
//! a TOML settings file, logging, and signal handling. The `ferry` binary is
//! a thin wrapper around [`run::execute`].

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod cli;
pub mod manifest;
pub mod run;
pub mod settings;
pub mod shutdown;
pub mod telemetry;

pub use cli::{Action, MigrateArgs, OptionalArgs, Paths};
pub use manifest::{Manifest, ManifestSource};
pub use settings::Settings;
