//! End-to-end tests with a real child-process backend.
//!
//! The backend is a `sh` script speaking newline-delimited JSON-RPC on its
//! standard streams. Request ids from one gateway connection are sequential
//! starting at 1, so the script can answer positionally: initialize (id 1),
//! the initialized notification (no reply), tools/list (id 2), then one
//! tools/call (id 3).

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use waygate::http::router;
use waygate::{BackendSpec, GatewayConfig, GatewayServer};

/// Shell script implementing a minimal MCP server on stdio.
const STUB_SERVER: &str = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0"}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo_tool","description":"echoes input","inputSchema":{"type":"object"}}]}}'
read line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"from child"}]}}'
"#;

fn stdio_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.servers.insert(
        "local".to_string(),
        BackendSpec::Stdio {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), STUB_SERVER.to_string()],
        },
    );
    config
}

fn post_mcp(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("authorization", "Bearer tester")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_child_process_backend_serves_tools_end_to_end() {
    let server = Arc::new(GatewayServer::new(stdio_config()).without_process_exit());
    server.register_backends().await;
    let app = router(Arc::clone(&server));

    // Registration spawned the process, ran the handshake, and published
    // the prefixed tool with its schema repaired.
    let record = server.registry().record("local___echo_tool").unwrap();
    assert_eq!(record.backend_id, "local");
    assert_eq!(
        record.input_schema,
        Some(json!({"type": "object", "properties": {}}))
    );

    let response = app
        .clone()
        .oneshot(post_mcp(json!({
            "jsonrpc": "2.0", "id": "list-1", "method": "tools/list"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["result"]["tools"][0]["name"], json!("local___echo_tool"));
    // String request ids survive end-to-end.
    assert_eq!(body["id"], json!("list-1"));

    let response = app
        .oneshot(post_mcp(json!({
            "jsonrpc": "2.0", "id": 9, "method": "tools/call",
            "params": {"name": "local___echo_tool", "arguments": {"input": "hi"}}
        })))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["result"]["content"][0]["text"], json!("from child"));
    assert_eq!(body["id"], json!(9));
}

#[tokio::test]
async fn test_child_process_is_terminated_by_close() {
    let server = Arc::new(GatewayServer::new(stdio_config()).without_process_exit());
    server.register_backends().await;
    let app = router(server);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/close")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["serversTerminated"], json!(1));

    // Tool calls after shutdown observe the closed gateway.
    let response = app
        .oneshot(post_mcp(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "local___echo_tool"}
        })))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert!(body.get("error").is_some());
}

#[tokio::test]
async fn test_failing_spawn_is_reported_by_health_not_fatal() {
    let mut config = GatewayConfig::default();
    config.servers.insert(
        "broken".to_string(),
        BackendSpec::Stdio {
            command: "/nonexistent/mcp-server".to_string(),
            args: vec![],
        },
    );
    let server = Arc::new(GatewayServer::new(config).without_process_exit());
    server.register_backends().await;
    let app = router(server);

    // The gateway still serves; health reports the failure.
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], json!("unhealthy"));
    assert_eq!(body["servers"]["broken"]["status"], json!("error"));
}
