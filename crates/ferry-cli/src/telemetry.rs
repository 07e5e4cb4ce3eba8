//! Log setup
//!
//! Diagnostics go to stderr so stdout stays free for migration output, which
//! a parent process may be multiplexing.

use crate::settings::{LogFormat, LoggingSettings};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` wins over the settings file. Worker processes use the quieter
/// `worker_level`. Calling this twice keeps the first subscriber.
pub fn init(logging: &LoggingSettings, worker: bool) {
    let fallback = if worker {
        &logging.worker_level
    } else {
        &logging.level
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match logging.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
