//! Shutdown signalling
//!
//! SIGINT and SIGTERM flip a watch channel to `true`. The worker pool and the
//! sequential runner both observe it and stop their work, and so does a
//! worker process, which exits with 130 instead of finishing its chunk.

use std::fmt;
use tokio::signal;
use tokio::sync::watch;

/// Why shutdown was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    SigInt,
    SigTerm,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigInt => f.write_str("SIGINT"),
            Self::SigTerm => f.write_str("SIGTERM"),
        }
    }
}

/// Shutdown trigger shared by the signal task and tests
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Trigger on the first SIGINT or SIGTERM
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen_for_signals(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                () = interrupt() => ShutdownReason::SigInt,
                () = terminate() => ShutdownReason::SigTerm,
            };
            tracing::warn!(%reason, "shutdown requested");
            shutdown.trigger();
        });
    }
}

/// Resolve once `rx` reads `true`; never resolves if the sender is gone first
pub async fn requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn interrupt() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to register SIGINT handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_subscribers() {
        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        assert!(!shutdown.is_triggered());

        let waiter = tokio::spawn(requested(rx));
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn dropped_sender_never_requests() {
        let rx = Shutdown::new().subscribe();
        let outcome = tokio::time::timeout(Duration::from_millis(50), requested(rx)).await;
        assert!(outcome.is_err());
    }
}
