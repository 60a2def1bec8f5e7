use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Why the process is shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT
    Signal,
    /// Requested from code (tests, fatal server error)
    Requested,
}

/// Process-wide shutdown coordinator.
///
/// Servers and the controller hold child tokens from [`GracefulShutdown::token`]
/// and stop once it is cancelled. The first trigger wins; later ones are ignored.
#[derive(Clone)]
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Coordinator with a 30 second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
            drain_timeout,
        }
    }

    /// A token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// How long tasks get to finish after shutdown starts.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            tracing::debug!(?reason, "shutdown already initiated, ignoring");
            return;
        }
        *current = Some(reason);
        drop(current);

        tracing::info!(?reason, "shutdown initiated");
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown. Returns early if
    /// shutdown is triggered some other way.
    pub async fn run_signal_handler(&self) {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT");
                self.trigger_shutdown(ShutdownReason::Signal);
            }
            _ = wait_for_sigterm() => {
                tracing::info!("received SIGTERM");
                self.trigger_shutdown(ShutdownReason::Signal);
            }
            _ = self.token.cancelled() => {}
        }
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Requested)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
