//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! The first signal requests a soft stop: the in-flight state machine
//! transition is allowed to finish, then the sequence aborts. A second signal
//! cancels hard: retry sleeps and pending attempts abort immediately.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    soft: CancellationToken,
    hard: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn soft_requested(&self) -> bool {
        self.soft.is_cancelled()
    }

    pub fn hard_requested(&self) -> bool {
        self.hard.is_cancelled()
    }

    pub fn request_soft(&self) {
        self.soft.cancel();
    }

    /// A hard stop implies a soft stop.
    pub fn request_hard(&self) {
        self.soft.cancel();
        self.hard.cancel();
    }

    /// Resolves when a hard stop has been requested.
    pub async fn hard_cancelled(&self) {
        self.hard.cancelled().await
    }

    /// Spawn a background task translating SIGINT/SIGTERM into soft, then
    /// hard, stop requests.
    pub fn install_signal_handlers(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            loop {
                wait_for_signal().await;

                if !shutdown.soft_requested() {
                    warn!(
                        "Received signal to terminate, will exit after the current \
                         operation. Send the signal again to force exit."
                    );
                    shutdown.request_soft();
                } else {
                    error!("Force exiting. You may have unfinished operations.");
                    shutdown.request_hard();
                    return;
                }
            }
        });
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_then_hard() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.soft_requested());
        assert!(!shutdown.hard_requested());

        shutdown.request_soft();
        assert!(shutdown.soft_requested());
        assert!(!shutdown.hard_requested());

        shutdown.request_hard();
        assert!(shutdown.hard_requested());
    }

    #[test]
    fn test_hard_implies_soft() {
        let shutdown = Shutdown::new();
        shutdown.request_hard();
        assert!(shutdown.soft_requested());
    }

    #[tokio::test]
    async fn test_hard_cancelled_resolves() {
        let shutdown = Shutdown::new();
        shutdown.request_hard();
        shutdown.hard_cancelled().await;
    }
}
