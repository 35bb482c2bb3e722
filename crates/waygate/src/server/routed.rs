//! Routed exposure: one MCP subserver per `(backend, session)` pair.
//!
//! Each subserver advertises its backend's tools under their original
//! names and delegates every call to the unified handler closures, so the
//! cache never goes stale. It exists to honor subserver-per-session
//! semantics: repeated requests for the same pair must reach the same
//! subserver instance.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use waygate_protocol::jsonrpc::JsonRpcResponse;

use crate::server::GatewayServer;
use crate::server::unified::Exposure;

/// A per-(backend, session) MCP subserver.
#[derive(Debug)]
pub struct RoutedSubserver {
    backend_id: String,
    session_id: String,
}

impl RoutedSubserver {
    /// The backend this subserver fronts.
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// The client session this subserver belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Handle one MCP message addressed to this subserver.
    pub async fn handle_message(
        &self,
        server: &GatewayServer,
        raw: &[u8],
    ) -> Option<JsonRpcResponse> {
        server
            .handle_mcp_message(
                Exposure::Routed {
                    backend_id: &self.backend_id,
                },
                Some(&self.session_id),
                raw,
            )
            .await
    }
}

/// Cache of routed subservers keyed by `(backend, session)`.
///
/// The map's entry API collapses two concurrent first-requests for the
/// same pair into one creation.
#[derive(Debug, Default)]
pub struct RoutedCache {
    cache: DashMap<(String, String), Arc<RoutedSubserver>>,
}

impl RoutedCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The subserver for a pair, created on first request and reused
    /// afterwards.
    pub fn get_or_create(&self, backend_id: &str, session_id: &str) -> Arc<RoutedSubserver> {
        let key = (backend_id.to_string(), session_id.to_string());
        Arc::clone(&self.cache.entry(key).or_insert_with(|| {
            debug!(backend = backend_id, session = session_id, "routed subserver created");
            Arc::new(RoutedSubserver {
                backend_id: backend_id.to_string(),
                session_id: session_id.to_string(),
            })
        }))
    }

    /// Number of live subservers.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
