//! Backend connections: one persistent JSON-RPC session per configured
//! backend.
//!
//! A [`BackendConnection`] owns its transport (child process or remote
//! HTTP), a monotonic request-id counter, and performs the MCP
//! initialization handshake once before the first caller request. The
//! [`Launcher`] creates connections lazily and tears them down exactly once.

pub mod child;
pub mod http;
pub mod launcher;

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{Value, json};
use tracing::{debug, warn};
use waygate_protocol::jsonrpc::{JsonRpcNotification, JsonRpcRequest};
use waygate_protocol::types::{PROTOCOL_VERSION, methods};

use crate::config::BackendSpec;
use crate::error::{GatewayError, GatewayResult};

pub use child::ChildProcessTransport;
pub use http::{HttpTransport, MCP_SESSION_HEADER};
pub use launcher::Launcher;

/// Transport behind a backend connection
enum TransportKind {
    /// Child process over standard streams
    Child(ChildProcessTransport),
    /// Remote server over HTTP POST
    Http(HttpTransport),
}

/// One persistent JSON-RPC session with a backend MCP server.
pub struct BackendConnection {
    backend_id: String,
    transport: TransportKind,
    next_id: AtomicI64,
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("backend_id", &self.backend_id)
            .finish_non_exhaustive()
    }
}

impl BackendConnection {
    /// Establish a connection per the backend descriptor and run the MCP
    /// initialization handshake.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::BackendConnection` when the transport cannot
    /// be established, and whatever the backend reports when `initialize`
    /// fails.
    pub async fn connect(backend_id: &str, spec: &BackendSpec) -> GatewayResult<Self> {
        let transport = match spec {
            BackendSpec::Stdio { command, args } => {
                TransportKind::Child(ChildProcessTransport::spawn(command, args)?)
            }
            BackendSpec::Http { url, headers } => {
                TransportKind::Http(HttpTransport::new(url.clone(), headers.clone()))
            }
        };

        let connection = Self {
            backend_id: backend_id.to_string(),
            transport,
            next_id: AtomicI64::new(1),
        };
        connection.initialize().await?;
        Ok(connection)
    }

    /// The backend this connection belongs to.
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// MCP handshake: `initialize` followed by `notifications/initialized`.
    async fn initialize(&self) -> GatewayResult<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "waygate",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self
            .send_request_with_session(methods::INITIALIZE, Some(params), None)
            .await?;
        debug!(
            backend = %self.backend_id,
            server = %result
                .pointer("/serverInfo/name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown"),
            "backend initialized"
        );

        let initialized =
            JsonRpcNotification::new(methods::NOTIFICATION_INITIALIZED, None);
        let sent = match &self.transport {
            TransportKind::Child(child) => child.send_notification(&initialized).await,
            TransportKind::Http(remote) => remote.send_notification(&initialized, None).await,
        };
        if let Err(e) = sent {
            // Some servers reject the notification POST; the session still works.
            warn!(backend = %self.backend_id, error = %e, "initialized notification not accepted");
        }
        Ok(())
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request with no client session attached.
    ///
    /// # Errors
    ///
    /// Backend JSON-RPC errors surface as `GatewayError::Rpc` with
    /// `code`/`message`/`data` preserved; transport failures as
    /// `GatewayError::Backend`.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> GatewayResult<Value> {
        self.send_request_with_session(method, params, None).await
    }

    /// Send a request, forwarding `session` to remote-http transports as
    /// the `Mcp-Session-Id` header. Child transports have no use for it.
    ///
    /// # Errors
    ///
    /// See [`BackendConnection::send_request`].
    pub async fn send_request_with_session(
        &self,
        method: &str,
        params: Option<Value>,
        session: Option<&str>,
    ) -> GatewayResult<Value> {
        let request = JsonRpcRequest::new(method, params, self.next_request_id().into());
        let response = match &self.transport {
            TransportKind::Child(child) => child.send_request(&request).await?,
            TransportKind::Http(remote) => remote.send_request(&request, session).await?,
        };
        response.into_result().map_err(GatewayError::from_rpc)
    }

    /// Tear down the transport. Outstanding requests fail.
    pub async fn shutdown(&self) {
        debug!(backend = %self.backend_id, "closing backend connection");
        match &self.transport {
            TransportKind::Child(child) => child.shutdown().await,
            TransportKind::Http(_) => {}
        }
    }
}
