//! Settings file
//!
//! `ferry.toml` supplies defaults for run flags, logging, and where each
//! source's manifest and completion state live. Command-line flags win over
//! the file; the file wins over built-in defaults.

use ferry_core::types::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_PROCESSES, DEFAULT_MAX_RECORDS_PER_PROCESS, DEFAULT_MAX_RETRIES,
};
use ferry_core::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File looked up in the working directory when no `--config` is given
pub const DEFAULT_SETTINGS_FILE: &str = "ferry.toml";

/// State directory used when a source does not name one
pub const DEFAULT_STATE_DIR: &str = ".ferry/state";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub defaults: RunDefaults,
    pub logging: LoggingSettings,
    pub sources: IndexMap<String, SourceSettings>,
}

/// Defaults for run flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub batch_size: u64,
    pub max_processes: usize,
    pub max_records_per_process: u64,
    pub max_retries: u32,
    pub memory_limit_mb: Option<u64>,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_processes: DEFAULT_MAX_PROCESSES,
            max_records_per_process: DEFAULT_MAX_RECORDS_PER_PROCESS,
            max_retries: DEFAULT_MAX_RETRIES,
            memory_limit_mb: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    /// Filter used by worker processes when `RUST_LOG` is unset
    pub worker_level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            worker_level: "warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Where a source's data and state live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Manifest describing the source's entities
    pub manifest: PathBuf,
    /// Directory for completion markers
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Settings {
    /// Parse settings from TOML text
    ///
    /// # Errors
    /// Returns `ConfigError::Load` on malformed TOML.
    pub fn from_toml(text: &str, origin: impl std::fmt::Display) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::load(origin, e))
    }

    /// Read settings from `path`
    ///
    /// Relative manifest and state paths are resolved against the settings
    /// file's directory.
    ///
    /// # Errors
    /// Returns `ConfigError::Load` if the file is unreadable or malformed.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::load(path.display(), e))?;
        let mut settings = Self::from_toml(&text, path.display())?;
        if let Some(base) = path.parent() {
            settings.resolve_relative_to(base);
        }
        tracing::debug!(path = %path.display(), sources = settings.sources.len(), "settings loaded");
        Ok(settings)
    }

    /// Settings from an explicit path, else `ferry.toml` if present, else
    /// built-in defaults
    ///
    /// # Errors
    /// Returns `ConfigError::Load` if an explicit path is missing or any
    /// chosen file is malformed.
    pub async fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path).await;
        }
        let fallback = Path::new(DEFAULT_SETTINGS_FILE);
        if tokio::fs::try_exists(fallback).await.unwrap_or(false) {
            return Self::load(fallback).await;
        }
        Ok(Self::default())
    }

    #[must_use]
    pub fn source(&self, name: &str) -> Option<&SourceSettings> {
        self.sources.get(name)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        for source in self.sources.values_mut() {
            if source.manifest.is_relative() {
                source.manifest = base.join(&source.manifest);
            }
            if let Some(dir) = source.state_dir.as_mut().filter(|d| d.is_relative()) {
                *dir = base.join(&*dir);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_yields_defaults() {
        let settings = Settings::from_toml("", "inline").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.defaults.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(settings.logging.worker_level, "warn");
    }

    #[test]
    fn parses_all_tables() {
        let settings = Settings::from_toml(
            r#"
            [defaults]
            batch_size = 250
            max_processes = 8
            memory_limit_mb = 1024

            [logging]
            level = "debug"
            format = "json"

            [sources.legacy]
            manifest = "legacy.toml"
            state_dir = "/var/lib/ferry"
            "#,
            "inline",
        )
        .unwrap();

        assert_eq!(settings.defaults.batch_size, 250);
        assert_eq!(settings.defaults.max_processes, 8);
        assert_eq!(settings.defaults.max_records_per_process, DEFAULT_MAX_RECORDS_PER_PROCESS);
        assert_eq!(settings.defaults.memory_limit_mb, Some(1024));
        assert_eq!(settings.logging.format, LogFormat::Json);
        let legacy = settings.source("legacy").unwrap();
        assert_eq!(legacy.manifest, PathBuf::from("legacy.toml"));
        assert_eq!(legacy.state_dir, Some(PathBuf::from("/var/lib/ferry")));
    }

    #[test]
    fn malformed_toml_is_a_load_error() {
        let err = Settings::from_toml("[defaults\nbatch_size = ", "broken.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Load { ref path, .. } if path == "broken.toml"));
    }

    #[test]
    fn relative_paths_resolve_against_settings_dir() {
        let mut settings = Settings::from_toml(
            r#"
            [sources.legacy]
            manifest = "legacy.toml"
            state_dir = "state"
            "#,
            "inline",
        )
        .unwrap();
        settings.resolve_relative_to(Path::new("/etc/ferry"));

        let legacy = settings.source("legacy").unwrap();
        assert_eq!(legacy.manifest, PathBuf::from("/etc/ferry/legacy.toml"));
        assert_eq!(legacy.state_dir, Some(PathBuf::from("/etc/ferry/state")));
    }
}
