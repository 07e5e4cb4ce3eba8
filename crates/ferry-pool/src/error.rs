//! Worker pool errors
//!
//! Chunk failures are not errors: they are retried and then reported. These
//! variants cover the pool itself.

/// Worker pool error
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Worker process could not be started
    #[error("failed to spawn worker for {chunk}: {source}")]
    Spawn {
        /// Chunk the worker was meant to migrate
        chunk: String,
        #[source]
        source: std::io::Error,
    },

    /// Shutdown requested while workers were running
    #[error("worker pool interrupted")]
    Interrupted,

    /// Settings that cannot make progress
    #[error("invalid pool settings: {0}")]
    InvalidSettings(String),

    /// Every event sender went away while workers were active
    #[error("worker event channel closed")]
    ChannelClosed,
}

impl PoolError {
    /// Whether a rerun of the same chunk may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_errors_are_retryable() {
        let err = PoolError::Spawn {
            chunk: "users[0, 100)".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("users[0, 100)"));
        assert!(!PoolError::Interrupted.is_retryable());
    }
}
