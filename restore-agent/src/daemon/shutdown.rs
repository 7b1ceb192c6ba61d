//! Cancellation on SIGTERM and SIGINT.
//!
//! Ensures that:
//! - every remote command and download in flight is abandoned promptly
//! - files not yet imported are counted as failed instead of silently dropped
//! - the run still produces a result (and a notification)

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when shutdown is requested; hand clones to every component.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT), then cancel the token
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling restore...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling restore...");
            }
            _ = self.token.cancelled() => {
                return;
            }
        }

        self.token.cancel();
    }

    /// Listen for signals in the background for as long as the run lasts.
    pub fn spawn_signal_listener(self) -> (CancellationToken, JoinHandle<()>) {
        let token = self.token();
        let handle = tokio::spawn(async move { self.wait_for_signal().await });
        (token, handle)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_reaches_child_tokens() {
        let coordinator = ShutdownCoordinator::new();
        let child = coordinator.token().child_token();

        // Spawn a task that will receive shutdown
        let handle = tokio::spawn(async move {
            child.cancelled().await;
        });

        coordinator.token().cancel();

        // Task should complete
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_exits_once_cancelled() {
        let (token, handle) = ShutdownCoordinator::new().spawn_signal_listener();
        token.cancel();
        handle.await.unwrap();
    }
}
