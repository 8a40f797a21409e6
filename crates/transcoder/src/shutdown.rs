//! Process-wide shutdown.
//!
//! On SIGINT, SIGTERM or SIGHUP the coordinator cancels its token (so the
//! HTTP listener stops accepting) and then destroys every transcode task.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::TaskRegistry;

pub struct ShutdownCoordinator {
    registry: TaskRegistry,
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry,
            token: CancellationToken::new(),
        }
    }

    /// Cancelled as soon as shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop accepting work and terminate every task. Safe to call twice.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.registry.shutdown().await;
    }

    /// Wait for a termination signal (or an external cancel of the token),
    /// then shut down.
    pub async fn run(&self) {
        tokio::select! {
            res = wait_for_shutdown_signal() => match res {
                Ok(()) => info!("termination signal received"),
                Err(e) => warn!(error = %e, "signal handlers unavailable; shutting down"),
            },
            _ = self.token.cancelled() => info!("shutdown requested"),
        }
        self.shutdown().await;
    }
}

/// Completes when the process receives SIGINT, SIGTERM or SIGHUP.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sighup.recv() => {},
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TranscoderConfig;

    #[tokio::test]
    async fn shutdown_cancels_token_and_registry() {
        let registry = TaskRegistry::new(TranscoderConfig::default());
        let coordinator = ShutdownCoordinator::new(registry.clone());
        let token = coordinator.token();

        coordinator.shutdown().await;
        assert!(token.is_cancelled());
        assert!(registry.is_shutting_down());

        // second call is a no-op
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn run_returns_after_external_cancel() {
        let registry = TaskRegistry::new(TranscoderConfig::default());
        let coordinator = ShutdownCoordinator::new(registry.clone());
        coordinator.token().cancel();

        tokio::time::timeout(std::time::Duration::from_secs(5), coordinator.run())
            .await
            .expect("run should finish once the token is cancelled");
        assert!(registry.is_shutting_down());
    }
}
