//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the shared token. The sync step watches it, stops the
//! sync process and fails the run with `Cancelled`, so the backup is left
//! `.incomplete`, the post hook still runs and the destination lock is
//! released on the way out.

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

    /// Token cancelled once a shutdown signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Listen for SIGINT/SIGTERM in the background and cancel the token on
    /// the first one.
    pub fn listen(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => token.cancel(),
                _ = token.cancelled() => {}
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn wait_for_signal() {
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
            info!("Received SIGINT (Ctrl+C), stopping backup...");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping backup...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_exits_when_token_cancelled() {
        let coordinator = ShutdownCoordinator::new();
        let handle = coordinator.listen();

        let token = coordinator.token();
        assert!(!token.is_cancelled());

        // Cancelling from elsewhere must also stop the listener task.
        coordinator.token().cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }
}
