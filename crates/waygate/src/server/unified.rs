//! MCP method dispatch for the unified endpoint (and, via name mapping,
//! the routed subservers).
//!
//! The unified endpoint advertises the aggregated, prefixed tool catalog.
//! Routed exposure reuses the same dispatch with the backend's unprefixed
//! names and a per-backend `serverInfo` name.

use serde_json::{Value, json};
use tracing::{debug, warn};
use waygate_protocol::jsonrpc::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, error_codes,
};
use waygate_protocol::types::{
    Implementation, InitializeRequest, InitializeResult, PROTOCOL_VERSION, ServerCapabilities,
    methods,
};

use crate::config::SYS_BACKEND_ID;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{ToolCall, prefixed_name};
use crate::server::{GatewayServer, SERVER_NAME};

/// Which face of the gateway a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure<'a> {
    /// The single aggregated endpoint; tool names carry backend prefixes
    Unified,
    /// A per-backend endpoint; tool names are unprefixed
    Routed {
        /// The backend this endpoint serves
        backend_id: &'a str,
    },
}

/// The prefixed name of the session-bootstrap tool.
fn sys_init_name() -> String {
    prefixed_name(SYS_BACKEND_ID, "init")
}

impl GatewayServer {
    /// Handle one MCP message body.
    ///
    /// Returns `None` for notifications (the HTTP layer answers 202) and
    /// `Some` response for requests, including parse errors.
    pub async fn handle_mcp_message(
        &self,
        exposure: Exposure<'_>,
        client_id: Option<&str>,
        raw: &[u8],
    ) -> Option<JsonRpcResponse> {
        let message: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(e) => return Some(JsonRpcResponse::parse_error(Some(e.to_string()))),
        };

        // Batches are out of scope; each request maps to one backend call.
        if !message.is_object() {
            return Some(JsonRpcResponse::parse_error(Some(
                "expected a single JSON-RPC message object".to_string(),
            )));
        }

        // Notifications carry no id and get no response.
        if message.get("id").is_none() {
            let method = message
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match method {
                methods::NOTIFICATION_INITIALIZED | methods::NOTIFICATION_CANCELLED => {
                    debug!(method, "notification accepted");
                }
                other => debug!(method = other, "notification ignored"),
            }
            return None;
        }

        let request: JsonRpcRequest = match serde_json::from_value(message.clone()) {
            Ok(request) => request,
            Err(e) => {
                // Keep the caller's id when it is usable; parse errors
                // without one answer with a null id.
                let response = match serde_json::from_value(message["id"].clone()) {
                    Ok(id) => JsonRpcResponse::error_response(
                        JsonRpcError::new(
                            error_codes::INVALID_REQUEST,
                            format!("Invalid Request: {e}"),
                        ),
                        id,
                    ),
                    Err(_) => JsonRpcResponse::parse_error(Some(e.to_string())),
                };
                return Some(response);
            }
        };
        let id = request.id.clone();

        let response = match self.dispatch(exposure, client_id, &request).await {
            Ok(result) => JsonRpcResponse::success(result, id),
            Err(e) => {
                warn!(
                    server = SERVER_NAME,
                    request_id = %id,
                    method = %request.method,
                    error_type = e.kind(),
                    detail = %e,
                    "request failed"
                );
                JsonRpcResponse::error_response(e.to_rpc_error(), id)
            }
        };
        Some(response)
    }

    async fn dispatch(
        &self,
        exposure: Exposure<'_>,
        client_id: Option<&str>,
        request: &JsonRpcRequest,
    ) -> GatewayResult<Value> {
        match request.method.as_str() {
            methods::INITIALIZE => {
                if let Some(params) = &request.params
                    && let Ok(init) =
                        serde_json::from_value::<InitializeRequest>(params.clone())
                {
                    debug!(
                        client = %init.client_info.name,
                        version = %init.client_info.version,
                        "client initializing"
                    );
                }
                Ok(self.initialize_result(exposure)?)
            }
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => {
                let tools = match exposure {
                    Exposure::Unified => self.registry().unified_tools(),
                    Exposure::Routed { backend_id } => {
                        self.registry().tools_for_backend(backend_id)
                    }
                };
                Ok(json!({ "tools": tools }))
            }
            methods::TOOLS_CALL => self.dispatch_tool_call(exposure, client_id, request).await,
            other => Err(GatewayError::from_rpc(JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ))),
        }
    }

    fn initialize_result(&self, exposure: Exposure<'_>) -> GatewayResult<Value> {
        let name = match exposure {
            Exposure::Unified => SERVER_NAME.to_string(),
            Exposure::Routed { backend_id } => format!("{SERVER_NAME}-{backend_id}"),
        };
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::tools_only(),
            server_info: Implementation {
                name,
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn dispatch_tool_call(
        &self,
        exposure: Exposure<'_>,
        client_id: Option<&str>,
        request: &JsonRpcRequest,
    ) -> GatewayResult<Value> {
        let params = request.params.clone().ok_or_else(|| {
            GatewayError::from_rpc(JsonRpcError::new(
                error_codes::INVALID_PARAMS,
                "Missing params for tools/call",
            ))
        })?;
        let call: waygate_protocol::types::CallToolRequest = serde_json::from_value(params)?;

        let unified_name = match exposure {
            Exposure::Unified => call.name.clone(),
            Exposure::Routed { backend_id } => prefixed_name(backend_id, &call.name),
        };

        // Init-before-use: with DIFC on, every tool except the bootstrap
        // requires an established session.
        if self.difc_enabled() && unified_name != sys_init_name() {
            let session = client_id.and_then(|id| self.sessions().resolve(id));
            if session.is_none() {
                return Err(GatewayError::SessionNotInitialized);
            }
        } else if !self.difc_enabled()
            && let Some(id) = client_id
        {
            // DIFC off: bind the identity to a session lazily.
            self.sessions().resolve(id);
        }

        let handler = self
            .registry()
            .handler_by_prefixed(&unified_name)
            .ok_or_else(|| GatewayError::UnknownTool(unified_name.clone()))?;

        let result = handler(ToolCall {
            client_id: client_id.map(str::to_string),
            arguments: call.arguments,
        })
        .await?;

        Ok(wrap_tool_result(result))
    }
}

/// Surface a backend result as a tool result object: values that already
/// carry `content` pass through unchanged; anything else becomes a single
/// text content item.
fn wrap_tool_result(result: Value) -> Value {
    match &result {
        Value::Object(map) if map.contains_key("content") => result,
        Value::String(text) => json!({
            "content": [{"type": "text", "text": text}]
        }),
        other => json!({
            "content": [{"type": "text", "text": other.to_string()}]
        }),
    }
}
