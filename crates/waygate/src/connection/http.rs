//! Remote HTTP backend transport.
//!
//! Each JSON-RPC request is one HTTP POST. The transport carries the fixed
//! headers from configuration and manages the `Mcp-Session-Id` header:
//! a caller-provided client session wins, otherwise the backend-assigned id
//! captured from an earlier response is echoed, otherwise a synthetic
//! `gateway-init-<rand>` id is sent so backends that require the header
//! accept the very first request.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use waygate_protocol::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use crate::error::{GatewayError, GatewayResult};

/// Session header propagated to and captured from backends
pub const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";

/// Remote HTTP transport for one backend connection.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    fixed_headers: BTreeMap<String, String>,
    /// Session id assigned by the backend on an earlier response
    backend_session: RwLock<Option<String>>,
    /// Synthetic id used until a client or backend session exists
    init_session: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .field("backend_session", &*self.backend_session.read())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create a transport for the given endpoint.
    pub fn new(url: impl Into<String>, fixed_headers: BTreeMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            fixed_headers,
            backend_session: RwLock::new(None),
            init_session: format!("gateway-init-{}", Uuid::new_v4()),
        }
    }

    /// The session id that will accompany a request carrying `session`.
    fn effective_session(&self, session: Option<&str>) -> String {
        if let Some(session) = session {
            return session.to_string();
        }
        self.backend_session
            .read()
            .clone()
            .unwrap_or_else(|| self.init_session.clone())
    }

    /// Remember a backend-assigned session id from a response.
    fn capture_session(&self, response: &reqwest::Response) {
        let Some(assigned) = response
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut stored = self.backend_session.write();
        if stored.as_deref() != Some(assigned) {
            debug!(session = assigned, url = %self.url, "backend assigned session id");
            *stored = Some(assigned.to_string());
        }
    }

    async fn post(
        &self,
        body: &impl serde::Serialize,
        session: Option<&str>,
    ) -> GatewayResult<reqwest::Response> {
        let mut builder = self
            .client
            .post(self.url.as_str())
            .header("Accept", "application/json, text/event-stream")
            .header(MCP_SESSION_HEADER, self.effective_session(session))
            .json(body);
        for (name, value) in &self.fixed_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            GatewayError::backend(format!("HTTP request to {} failed: {e}", self.url))
        })?;
        self.capture_session(&response);
        Ok(response)
    }

    /// Send one request and wait for its response.
    ///
    /// # Errors
    ///
    /// A non-2xx status becomes a `GatewayError::Rpc` whose message carries
    /// the decimal status and whose `data` is the response body (JSON-decoded
    /// when possible). Transport failures become `GatewayError::Backend`.
    pub async fn send_request(
        &self,
        request: &JsonRpcRequest,
        session: Option<&str>,
    ) -> GatewayResult<JsonRpcResponse> {
        trace!(method = %request.method, url = %self.url, "POST to backend");
        let response = self.post(request, session).await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await.map_err(|e| {
            GatewayError::backend(format!("failed to read backend response body: {e}"))
        })?;

        if !status.is_success() {
            return Err(GatewayError::from_http_status(status.as_u16(), &body));
        }

        let payload = if content_type.starts_with("text/event-stream") {
            sse_response_payload(&body).ok_or_else(|| {
                GatewayError::backend("backend SSE stream carried no JSON-RPC response")
            })?
        } else {
            body
        };

        serde_json::from_str::<JsonRpcResponse>(&payload).map_err(|e| {
            GatewayError::backend(format!("failed to parse backend response: {e}"))
        })
    }

    /// Send a notification; any 2xx acknowledgement is accepted.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError` on transport failure or non-2xx status.
    pub async fn send_notification(
        &self,
        notification: &JsonRpcNotification,
        session: Option<&str>,
    ) -> GatewayResult<()> {
        let response = self.post(notification, session).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(GatewayError::from_http_status(status.as_u16(), &body))
        }
    }
}

/// Extract the JSON-RPC response from a streamable-HTTP SSE body.
///
/// Backends answering a POST with `text/event-stream` deliver the response
/// as `data:` lines; the first event that parses as a response object wins.
fn sse_response_payload(body: &str) -> Option<String> {
    for event in body.split("\n\n") {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| {
                line.strip_prefix("data:")
                    .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
            })
            .collect();
        if data.is_empty() {
            continue;
        }
        let candidate = data.join("\n");
        if serde_json::from_str::<JsonRpcResponse>(&candidate).is_ok() {
            return Some(candidate);
        }
        warn!("SSE event was not a JSON-RPC response, skipping");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/mcp")
    }

    fn request(id: i64, method: &str) -> JsonRpcRequest {
        JsonRpcRequest::new(method, None, id.into())
    }

    #[tokio::test]
    async fn test_round_trips_a_request() {
        let router = Router::new().route(
            "/mcp",
            post(|Json(body): Json<Value>| async move {
                Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": {"pong": true}}))
            }),
        );
        let url = serve(router).await;

        let transport = HttpTransport::new(url, BTreeMap::new());
        let response = transport.send_request(&request(1, "ping"), None).await.unwrap();
        assert_eq!(response.result(), Some(&json!({"pong": true})));
    }

    #[tokio::test]
    async fn test_sends_fixed_headers_and_synthetic_session() {
        let router = Router::new().route(
            "/mcp",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let session = headers
                    .get(MCP_SESSION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let auth = headers
                    .get("x-api-token")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {"session": session, "auth": auth}
                }))
            }),
        );
        let url = serve(router).await;

        let mut headers = BTreeMap::new();
        headers.insert("x-api-token".to_string(), "secret".to_string());
        let transport = HttpTransport::new(url, headers);

        let response = transport.send_request(&request(2, "x"), None).await.unwrap();
        let result = response.result().unwrap();
        assert_eq!(result["auth"], json!("secret"));
        let session = result["session"].as_str().unwrap();
        assert!(session.starts_with("gateway-init-"), "got {session}");
    }

    #[tokio::test]
    async fn test_caller_session_overrides_synthetic_id() {
        let router = Router::new().route(
            "/mcp",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let session = headers
                    .get(MCP_SESSION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": session}))
            }),
        );
        let url = serve(router).await;

        let transport = HttpTransport::new(url, BTreeMap::new());
        let response = transport
            .send_request(&request(3, "x"), Some("client-42"))
            .await
            .unwrap();
        assert_eq!(response.result(), Some(&json!("client-42")));
    }

    #[tokio::test]
    async fn test_echoes_backend_assigned_session() {
        let router = Router::new().route(
            "/mcp",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let seen = headers
                    .get(MCP_SESSION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (
                    [(MCP_SESSION_HEADER, "backend-7")],
                    Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": seen})),
                )
            }),
        );
        let url = serve(router).await;

        let transport = HttpTransport::new(url, BTreeMap::new());
        // First request carries the synthetic id and captures "backend-7".
        transport.send_request(&request(1, "a"), None).await.unwrap();
        // Second request with no caller session echoes the captured id.
        let response = transport.send_request(&request(2, "b"), None).await.unwrap();
        assert_eq!(response.result(), Some(&json!("backend-7")));
    }

    #[tokio::test]
    async fn test_non_2xx_preserves_status_and_body() {
        let router = Router::new().route(
            "/mcp",
            post(|| async {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "type": "rate_limit_error",
                        "retry_after": 60,
                        "limit": 100,
                        "remaining": 0
                    })),
                )
                    .into_response()
            }),
        );
        let url = serve(router).await;

        let transport = HttpTransport::new(url, BTreeMap::new());
        let err = transport.send_request(&request(1, "x"), None).await.unwrap_err();
        let rpc = err.to_rpc_error();
        assert!(rpc.message.contains("429"));
        let data = rpc.data.unwrap();
        assert_eq!(data["type"], json!("rate_limit_error"));
        assert_eq!(data["retry_after"], json!(60));
    }

    #[tokio::test]
    async fn test_unwraps_single_event_sse_response() {
        let router = Router::new().route(
            "/mcp",
            post(|Json(body): Json<Value>| async move {
                let payload =
                    json!({"jsonrpc": "2.0", "id": body["id"], "result": "from-sse"});
                (
                    [("content-type", "text/event-stream")],
                    format!("event: message\ndata: {payload}\n\n"),
                )
            }),
        );
        let url = serve(router).await;

        let transport = HttpTransport::new(url, BTreeMap::new());
        let response = transport.send_request(&request(9, "x"), None).await.unwrap();
        assert_eq!(response.result(), Some(&json!("from-sse")));
    }

    #[test]
    fn test_sse_payload_extraction() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":5}\n\n";
        let payload = sse_response_payload(body).unwrap();
        assert!(payload.contains("\"result\":5"));

        assert!(sse_response_payload("event: ping\n\n").is_none());
        assert!(sse_response_payload("").is_none());
    }

    #[tokio::test]
    async fn test_connection_refused_is_backend_error() {
        // Port 1 on localhost is essentially never listening.
        let transport = HttpTransport::new("http://127.0.0.1:1/mcp", BTreeMap::new());
        let err = transport.send_request(&request(1, "x"), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend { .. }));
    }
}
