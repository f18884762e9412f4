//! Graceful shutdown coordination for Forwardlytics.
//!
//! This module provides a [`ShutdownSignal`] that tells the HTTP server to
//! stop accepting connections and drain in-flight requests when a
//! termination signal is received.
//!
//! # Example
//!
//! ```rust,ignore
//! use forwardlytics::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! tokio::spawn({
//!     let shutdown = shutdown.clone();
//!     async move { shutdown.listen().await }
//! });
//!
//! axum::serve(listener, app)
//!     .with_graceful_shutdown(async move { shutdown.recv().await })
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Default drain timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown.
///
/// Clones share state: triggering one triggers all of them, and a signal
/// triggered before anyone waits is not lost.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    /// How long in-flight requests get to finish
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    ///
    /// Returns early if shutdown is triggered some other way.
    pub async fn listen(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.recv() => return,
        }

        self.sender.send_replace(true);
    }

    /// Resolve once shutdown has been triggered.
    pub async fn recv(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so this only errors if it is dropped.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.sender.send_replace(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));

        let pending = tokio::time::timeout(Duration::from_millis(20), signal.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_custom_timeout() {
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(60));
        assert_eq!(signal.timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), signal.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_trigger_before_recv_is_not_lost() {
        let signal = ShutdownSignal::new();
        signal.clone().trigger();

        let result = tokio::time::timeout(Duration::from_millis(100), signal.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_listen_returns_after_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let result = tokio::time::timeout(Duration::from_millis(100), signal.listen()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_clones_observe_trigger() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();

        signal.trigger();

        let result = tokio::time::timeout(Duration::from_millis(100), other.recv()).await;
        assert!(result.is_ok());
    }
}
