//! Idempotent graceful termination.
//!
//! The first close terminates every established backend connection and
//! reports how many; every later close observes `AlreadyClosed`. The
//! transition from running to closed happens exactly once and is terminal.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::connection::Launcher;
use crate::error::GatewayError;

/// Delay between answering `/close` and exiting the process, so the
/// response reaches the client.
const EXIT_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Outcome of a close attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call performed the shutdown
    Closed {
        /// Number of backend connections terminated by this call
        servers_terminated: usize,
    },
    /// The gateway was already closed
    AlreadyClosed,
}

/// Coordinates the single shutdown of the gateway.
pub struct ShutdownCoordinator {
    launcher: Arc<Launcher>,
    signal: watch::Sender<bool>,
    exit_on_close: bool,
}

impl ShutdownCoordinator {
    /// Create a coordinator over the launcher. By default the process
    /// exits shortly after the first close completes.
    pub fn new(launcher: Arc<Launcher>) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            launcher,
            signal,
            exit_on_close: true,
        }
    }

    /// Keep the process alive after close (tests, embedding).
    #[must_use]
    pub fn without_process_exit(mut self) -> Self {
        self.exit_on_close = false;
        self
    }

    /// Close the gateway. Idempotent: only the first call terminates
    /// backends; all later calls return [`CloseOutcome::AlreadyClosed`].
    pub async fn close(&self) -> CloseOutcome {
        match self.launcher.close().await {
            Ok(servers_terminated) => {
                info!(servers_terminated, "gateway shutdown initiated");
                let _ = self.signal.send(true);
                if self.exit_on_close {
                    tokio::spawn(async {
                        tokio::time::sleep(EXIT_DELAY).await;
                        std::process::exit(0);
                    });
                }
                CloseOutcome::Closed { servers_terminated }
            }
            Err(GatewayError::AlreadyClosed) => CloseOutcome::AlreadyClosed,
            // Launcher::close only fails with AlreadyClosed.
            Err(_) => CloseOutcome::AlreadyClosed,
        }
    }

    /// Whether the gateway has been closed.
    pub fn is_closed(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolve once the gateway closes; used as the HTTP server's graceful
    /// shutdown signal.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.signal.subscribe();
        async move {
            let _ = receiver.wait_for(|closed| *closed).await;
        }
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("closed", &self.is_closed())
            .field("exit_on_close", &self.exit_on_close)
            .finish()
    }
}
