/// Graceful shutdown handling for the Pub/Sub runtime
use tokio::signal;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};

/// Shutdown signal broadcaster
///
/// Cloning shares the same underlying signal. Child signals are cancelled
/// with their parent but can also be cancelled on their own.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A signal that fires when this one does, or when cancelled directly.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been triggered
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once shutdown is triggered
    pub fn wait(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Owned variant of [`wait`](Self::wait), for `'static` futures.
    pub async fn wait_owned(self) {
        self.token.cancelled_owned().await
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
pub async fn wait_for_signal() {
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
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

/// Trigger `shutdown_signal` once the process receives SIGINT or SIGTERM.
pub fn shutdown_on_signal(shutdown_signal: ShutdownSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown_signal.shutdown();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());

        signal.shutdown();

        // Should complete immediately
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();

        signal.shutdown();
        assert!(clone.is_shutdown());
    }

    #[tokio::test]
    async fn test_child_signal() {
        let parent = ShutdownSignal::new();
        let child = parent.child();

        // Cancelling a child leaves the parent untouched
        child.shutdown();
        assert!(child.is_shutdown());
        assert!(!parent.is_shutdown());

        let second = parent.child();
        parent.shutdown();
        tokio::time::timeout(Duration::from_secs(1), second.wait_owned())
            .await
            .unwrap();
    }
}
