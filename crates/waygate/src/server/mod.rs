//! The gateway server: aggregation state and startup registration.
//!
//! [`GatewayServer`] owns every long-lived component (launcher, registry,
//! sessions, policy pipeline, routed-subserver cache, shutdown coordinator)
//! and performs backend registration at startup: connect, `tools/list`,
//! publish prefixed tools. A backend that fails registration is logged,
//! reported unhealthy, and skipped; the gateway still serves the rest.

pub mod pipeline;
pub mod routed;
pub mod unified;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Value, json};
use tracing::{info, warn};
use waygate_protocol::types::{
    CallToolResult, ContentBlock, ListToolsResult, PROTOCOL_VERSION, methods,
};

use crate::config::{GatewayConfig, SYS_BACKEND_ID};
use crate::connection::Launcher;
use crate::difc::{GuardRegistry, PolicyMonitor};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{ToolRecord, ToolRegistry, prefixed_name};
use crate::session::SessionManager;
use crate::shutdown::ShutdownCoordinator;

pub use pipeline::ToolPipeline;
pub use routed::RoutedSubserver;

/// Name the unified endpoint reports in `serverInfo`.
pub const SERVER_NAME: &str = "waygate";

/// Per-backend registration status, reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHealth {
    /// Registration succeeded
    Healthy {
        /// Number of tools registered
        tools: usize,
    },
    /// Registration failed; the backend is skipped
    Error {
        /// Failure detail
        message: String,
    },
}

/// The aggregating gateway server.
pub struct GatewayServer {
    config: GatewayConfig,
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    guards: Arc<GuardRegistry>,
    pipeline: Arc<ToolPipeline>,
    health: DashMap<String, BackendHealth>,
    routed: routed::RoutedCache,
    shutdown: ShutdownCoordinator,
}

impl GatewayServer {
    /// Build a gateway from configuration. Call
    /// [`GatewayServer::register_backends`] before serving.
    pub fn new(config: GatewayConfig) -> Self {
        let launcher = Arc::new(Launcher::new(&config));
        let guards = Arc::new(GuardRegistry::new());
        let monitor = Arc::new(PolicyMonitor::new());
        let pipeline = Arc::new(ToolPipeline::new(
            Arc::clone(&launcher),
            Arc::clone(&guards),
            monitor,
            config.enable_difc,
        ));

        Self {
            registry: Arc::new(ToolRegistry::new()),
            sessions: Arc::new(SessionManager::new(config.enable_difc)),
            guards,
            pipeline,
            health: DashMap::new(),
            routed: routed::RoutedCache::new(),
            shutdown: ShutdownCoordinator::new(launcher),
            config,
        }
    }

    /// Disable the deferred process exit after `/close` (tests, embedding).
    #[must_use]
    pub fn without_process_exit(mut self) -> Self {
        self.shutdown = self.shutdown.without_process_exit();
        self
    }

    /// The gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The aggregated tool registry.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The per-backend guard registry.
    pub fn guards(&self) -> &Arc<GuardRegistry> {
        &self.guards
    }

    /// The tool-call pipeline.
    pub fn pipeline(&self) -> &Arc<ToolPipeline> {
        &self.pipeline
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// The routed-subserver cache.
    pub(crate) fn routed(&self) -> &routed::RoutedCache {
        &self.routed
    }

    /// Number of live routed subservers.
    pub fn routed_subserver_count(&self) -> usize {
        self.routed.len()
    }

    /// Whether DIFC enforcement is on.
    pub fn difc_enabled(&self) -> bool {
        self.config.enable_difc
    }

    /// Whether `backend_id` is routable (`/mcp/<backend_id>`): a configured
    /// backend, or `sys` when DIFC is on.
    pub fn is_routable_backend(&self, backend_id: &str) -> bool {
        self.config.servers.contains_key(backend_id)
            || (self.config.enable_difc && backend_id == SYS_BACKEND_ID)
    }

    /// Connect every configured backend, discover its tools, and publish
    /// them. Failures are per-backend: logged, reported by `/health`, and
    /// skipped.
    pub async fn register_backends(&self) {
        for backend_id in self.config.backend_ids() {
            match self.register_backend(&backend_id).await {
                Ok(count) => {
                    info!(backend = %backend_id, tools = count, "backend registered");
                    self.health
                        .insert(backend_id, BackendHealth::Healthy { tools: count });
                }
                Err(e) => {
                    warn!(
                        backend = %backend_id,
                        error_type = e.kind(),
                        error = %e,
                        "backend registration failed, skipping"
                    );
                    self.health.insert(
                        backend_id,
                        BackendHealth::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
        }

        if self.config.enable_difc {
            self.register_sys_tools();
        }
    }

    async fn register_backend(&self, backend_id: &str) -> GatewayResult<usize> {
        let connection = self.pipeline.launcher().get_or_launch(backend_id).await?;
        let value = connection.send_request(methods::TOOLS_LIST, None).await?;
        let list: ListToolsResult = serde_json::from_value(value)?;
        let count = list.tools.len();

        self.registry
            .register_backend_tools(backend_id, list.tools, |original| {
                self.pipeline.handler_for(backend_id, original)
            });
        Ok(count)
    }

    /// Publish the built-in sys tools. They never touch a backend
    /// connection; DIFC-off gateways do not expose them at all.
    fn register_sys_tools(&self) {
        let sessions = Arc::clone(&self.sessions);
        self.registry.insert(ToolRecord {
            name: prefixed_name(SYS_BACKEND_ID, "init"),
            description: Some(format!(
                "[{SYS_BACKEND_ID}] Initialize the client session; accepts an optional token"
            )),
            input_schema: Some(json!({
                "type": "object",
                "properties": {"token": {"type": "string"}}
            })),
            backend_id: SYS_BACKEND_ID.to_string(),
            handler: Arc::new(move |call| {
                let sessions = Arc::clone(&sessions);
                Box::pin(async move {
                    let client_id = call.client_id.as_deref().ok_or_else(|| {
                        GatewayError::from_rpc(waygate_protocol::jsonrpc::JsonRpcError::new(
                            waygate_protocol::jsonrpc::error_codes::INVALID_PARAMS,
                            "authorization header required to initialize a session",
                        ))
                    })?;
                    let token = call
                        .arguments
                        .as_ref()
                        .and_then(|a| a.get("token"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    sessions.init(client_id, token);
                    Ok(serde_json::to_value(CallToolResult::text(
                        "session initialized",
                    ))?)
                })
            }),
        });

        let server_ids = self.config.backend_ids();
        self.registry.insert(ToolRecord {
            name: prefixed_name(SYS_BACKEND_ID, "list_servers"),
            description: Some(format!(
                "[{SYS_BACKEND_ID}] List the configured backend identifiers"
            )),
            input_schema: Some(json!({"type": "object", "properties": {}})),
            backend_id: SYS_BACKEND_ID.to_string(),
            handler: Arc::new(move |_call| {
                let server_ids = server_ids.clone();
                Box::pin(async move {
                    let result = CallToolResult {
                        content: vec![ContentBlock::text(server_ids.join(", "))],
                        structured_content: Some(json!({ "servers": server_ids })),
                        is_error: None,
                    };
                    Ok(serde_json::to_value(result)?)
                })
            }),
        });
    }

    /// Build the `/health` response body.
    ///
    /// `status` is `"unhealthy"` iff any backend reports an error.
    pub fn health_report(&self) -> Value {
        let mut servers = serde_json::Map::new();
        let mut healthy = true;
        for backend_id in self.config.backend_ids() {
            let entry = match self.health.get(&backend_id).map(|h| h.clone()) {
                Some(BackendHealth::Healthy { tools }) => {
                    json!({"status": "healthy", "tools": tools})
                }
                Some(BackendHealth::Error { message }) => {
                    healthy = false;
                    json!({"status": "error", "error": message})
                }
                // Not yet registered; report as healthy-pending.
                None => json!({"status": "healthy"}),
            };
            servers.insert(backend_id, entry);
        }

        json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "specVersion": PROTOCOL_VERSION,
            "gatewayVersion": env!("CARGO_PKG_VERSION"),
            "servers": Value::Object(servers),
        })
    }

    /// Record a backend's health (used by tests injecting fixtures).
    pub fn set_backend_health(&self, backend_id: impl Into<String>, health: BackendHealth) {
        self.health.insert(backend_id.into(), health);
    }
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("backends", &self.config.backend_ids())
            .field("difc_enabled", &self.config.enable_difc)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_health_report_with_no_backends_is_healthy() {
        let server = GatewayServer::new(GatewayConfig::default()).without_process_exit();
        let report = server.health_report();
        assert_eq!(report["status"], json!("healthy"));
        assert_eq!(report["servers"], json!({}));
        assert!(!report["specVersion"].as_str().unwrap().is_empty());
        assert!(!report["gatewayVersion"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_one_error_backend_flips_status() {
        let mut config = GatewayConfig::default();
        config.servers.insert(
            "bad".to_string(),
            crate::config::BackendSpec::Stdio {
                command: "x".to_string(),
                args: vec![],
            },
        );
        config.servers.insert(
            "good".to_string(),
            crate::config::BackendSpec::Stdio {
                command: "y".to_string(),
                args: vec![],
            },
        );
        let server = GatewayServer::new(config).without_process_exit();
        server.set_backend_health("good", BackendHealth::Healthy { tools: 2 });
        server.set_backend_health(
            "bad",
            BackendHealth::Error {
                message: "spawn failed".to_string(),
            },
        );

        let report = server.health_report();
        assert_eq!(report["status"], json!("unhealthy"));
        assert_eq!(report["servers"]["good"]["status"], json!("healthy"));
        assert_eq!(report["servers"]["bad"]["status"], json!("error"));
    }

    #[tokio::test]
    async fn test_sys_tools_registered_only_with_difc() {
        let server = GatewayServer::new(GatewayConfig::default()).without_process_exit();
        server.register_backends().await;
        assert!(server.registry().handler("sys", "init").is_none());
        assert!(!server.is_routable_backend("sys"));

        let mut config = GatewayConfig::default();
        config.enable_difc = true;
        let server = GatewayServer::new(config).without_process_exit();
        server.register_backends().await;
        assert!(server.registry().handler("sys", "init").is_some());
        assert!(server.registry().handler("sys", "list_servers").is_some());
        assert!(server.is_routable_backend("sys"));
    }

    #[tokio::test]
    async fn test_sys_init_creates_the_session() {
        let mut config = GatewayConfig::default();
        config.enable_difc = true;
        let server = GatewayServer::new(config).without_process_exit();
        server.register_backends().await;

        assert!(server.sessions().resolve("alice").is_none());

        let handler = server.registry().handler("sys", "init").unwrap();
        let mut arguments = serde_json::Map::new();
        arguments.insert("token".to_string(), json!("tok"));
        handler(crate::registry::ToolCall {
            client_id: Some("alice".to_string()),
            arguments: Some(arguments),
        })
        .await
        .unwrap();

        let session = server.sessions().resolve("alice").unwrap();
        assert_eq!(session.token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_sys_init_without_identity_fails() {
        let mut config = GatewayConfig::default();
        config.enable_difc = true;
        let server = GatewayServer::new(config).without_process_exit();
        server.register_backends().await;

        let handler = server.registry().handler("sys", "init").unwrap();
        let err = handler(crate::registry::ToolCall::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rpc { .. }));
    }

    #[tokio::test]
    async fn test_sys_list_servers_reports_configured_ids() {
        let mut config = GatewayConfig::default();
        config.enable_difc = true;
        config.servers.insert(
            "github".to_string(),
            crate::config::BackendSpec::Stdio {
                command: "x".to_string(),
                args: vec![],
            },
        );
        let server = GatewayServer::new(config).without_process_exit();
        server.register_sys_tools();

        let handler = server.registry().handler("sys", "list_servers").unwrap();
        let result = handler(crate::registry::ToolCall::default()).await.unwrap();
        assert_eq!(result["structuredContent"]["servers"], json!(["github"]));
    }
}
