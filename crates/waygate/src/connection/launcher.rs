//! Backend connection lifecycle: lazy first launch, pooled reuse, teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::{BackendSpec, GatewayConfig};
use crate::connection::BackendConnection;
use crate::error::{GatewayError, GatewayResult};

/// Creates backend connections on first use and reuses them afterwards.
///
/// Exactly one connection exists per backend for the life of the process;
/// concurrent first callers for the same backend wait on a single creation.
/// `close` is the only destroyer and is safe to call repeatedly.
pub struct Launcher {
    backends: HashMap<String, BackendSlot>,
    closed: AtomicBool,
}

struct BackendSlot {
    spec: BackendSpec,
    cell: OnceCell<Arc<BackendConnection>>,
}

impl Launcher {
    /// Build a launcher with one slot per configured backend.
    pub fn new(config: &GatewayConfig) -> Self {
        let backends = config
            .servers
            .iter()
            .map(|(id, spec)| {
                (
                    id.clone(),
                    BackendSlot {
                        spec: spec.clone(),
                        cell: OnceCell::new(),
                    },
                )
            })
            .collect();
        Self {
            backends,
            closed: AtomicBool::new(false),
        }
    }

    /// Return the connection for `backend_id`, creating it on first call.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::BackendConnection` for unknown backends or
    /// when establishing the connection fails, and
    /// `GatewayError::AlreadyClosed` after shutdown.
    pub async fn get_or_launch(&self, backend_id: &str) -> GatewayResult<Arc<BackendConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::AlreadyClosed);
        }
        let slot = self.backends.get(backend_id).ok_or_else(|| {
            GatewayError::backend_connection_for("unknown backend", backend_id)
        })?;

        slot.cell
            .get_or_try_init(|| async {
                debug!(backend = backend_id, "launching backend connection");
                let connection = BackendConnection::connect(backend_id, &slot.spec).await?;
                Ok::<_, GatewayError>(Arc::new(connection))
            })
            .await
            .cloned()
    }

    /// Connections that were actually established.
    pub fn established(&self) -> Vec<Arc<BackendConnection>> {
        self.backends
            .values()
            .filter_map(|slot| slot.cell.get().cloned())
            .collect()
    }

    /// Close every established connection exactly once.
    ///
    /// Returns the number of connections terminated by this call.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::AlreadyClosed` on the second and subsequent
    /// calls; no connections are touched then.
    pub async fn close(&self) -> GatewayResult<usize> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::AlreadyClosed);
        }

        let established = self.established();
        let terminated = established.len();
        for connection in established {
            connection.shutdown().await;
        }
        info!(terminated, "backend connections closed");
        Ok(terminated)
    }
}
