//! Interrupt handling for SIGINT and SIGTERM.
//!
//! The first signal cancels the run's [`CancellationToken`]. Whatever is in
//! progress notices, stops, and the driver still tears down any bridge mount.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled once a signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
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
                info!("Received SIGINT (Ctrl+C), stopping...");
            }
            _ = terminate => {
                info!("Received SIGTERM, stopping...");
            }
            _ = self.token.cancelled() => return,
        }

        self.token.cancel();
    }

    /// Listen for signals in the background for the rest of the run.
    pub fn spawn_listener(self) -> (CancellationToken, JoinHandle<()>) {
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
