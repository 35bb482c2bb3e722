//! HTTP front end: endpoint mux, health, shutdown, MCP endpoints, and the
//! response-body logging wrapper.
//!
//! Routes:
//!
//! - `GET /health` - unauthenticated health report
//! - `POST /close` - idempotent shutdown (405 for other methods)
//! - `POST /mcp[/]` - unified MCP endpoint (prefixed tool names)
//! - `POST /mcp/{backend}[/]` - routed MCP endpoint (original tool names)
//! - `/mcp[/...]/.well-known/oauth-authorization-server` - always 404

pub mod auth;

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info};

use crate::error::GatewayResult;
use crate::server::GatewayServer;
use crate::server::unified::Exposure;
use crate::session::client_identity_from_header;
use crate::shutdown::CloseOutcome;

/// Request body ceiling for every endpoint (10 MiB).
pub const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Longest response-body slice written to the log.
const LOG_BODY_LIMIT: usize = 2048;

/// Build the gateway router.
pub fn router(server: Arc<GatewayServer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/close", post(close))
        .route("/mcp", post(unified_mcp))
        .route("/mcp/", post(unified_mcp))
        .route(
            "/mcp/.well-known/oauth-authorization-server",
            any(oauth_discovery),
        )
        .route("/mcp/{backend}", post(routed_mcp))
        .route("/mcp/{backend}/", post(routed_mcp))
        .route(
            "/mcp/{backend}/.well-known/oauth-authorization-server",
            any(oauth_discovery),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&server),
            auth::auth_middleware,
        ))
        .layer(middleware::from_fn(log_responses))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY))
        .with_state(server)
}

/// Serve the gateway until SIGINT or `/close`.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve(server: Arc<GatewayServer>) -> GatewayResult<()> {
    let bind = server.config().bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = %bind, "gateway listening");

    let shutdown = {
        let closed = server.shutdown().closed();
        async move {
            tokio::select! {
                _ = closed => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                }
            }
        }
    };

    let app = router(server);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// `GET /health`: always 200, never authenticated.
async fn health(State(server): State<Arc<GatewayServer>>) -> Response {
    Json(server.health_report()).into_response()
}

/// `POST /close`: idempotent shutdown.
async fn close(State(server): State<Arc<GatewayServer>>) -> Response {
    match server.shutdown().close().await {
        CloseOutcome::Closed { servers_terminated } => (
            StatusCode::OK,
            Json(json!({
                "status": "closed",
                "message": "Gateway shutdown initiated",
                "serversTerminated": servers_terminated,
            })),
        )
            .into_response(),
        CloseOutcome::AlreadyClosed => (
            StatusCode::GONE,
            Json(json!({ "error": "Gateway has already been closed" })),
        )
            .into_response(),
    }
}

/// The OAuth authorization-server discovery endpoint exists only to say no.
async fn oauth_discovery() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

/// First `Authorization` header value, if any.
fn first_auth_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// `POST /mcp`: the unified endpoint.
async fn unified_mcp(
    State(server): State<Arc<GatewayServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_id = match first_auth_header(&headers) {
        Some(header) => match client_identity_from_header(header) {
            Some(identity) => Some(identity),
            // A present but empty identity rejects the connection.
            None => {
                return (StatusCode::UNAUTHORIZED, "Unauthorized: empty client identity")
                    .into_response();
            }
        },
        None => None,
    };

    match server
        .handle_mcp_message(Exposure::Unified, client_id.as_deref(), &body)
        .await
    {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// `POST /mcp/{backend}`: the routed endpoints.
async fn routed_mcp(
    State(server): State<Arc<GatewayServer>>,
    Path(backend_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Routed exposure requires a client identity before the subserver runs.
    let Some(identity) = first_auth_header(&headers).and_then(client_identity_from_header)
    else {
        return (
            StatusCode::UNAUTHORIZED,
            "Unauthorized: missing Authorization header",
        )
            .into_response();
    };

    if !server.is_routable_backend(&backend_id) {
        return (StatusCode::NOT_FOUND, "unknown backend").into_response();
    }

    let subserver = server.routed().get_or_create(&backend_id, &identity);
    match subserver.handle_message(&server, &body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Response logging wrapper: captures status and body bytes after the
/// handler returns, then forwards the response unaltered.
async fn log_responses(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;
    let status = response.status();

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            // Streaming body could not be buffered; pass an empty body on.
            debug!(%method, path, status = status.as_u16(), "response body not captured");
            return Response::from_parts(parts, Body::empty());
        }
    };

    let shown = &bytes[..bytes.len().min(LOG_BODY_LIMIT)];
    debug!(
        %method,
        path,
        status = status.as_u16(),
        body_bytes = bytes.len(),
        body = %String::from_utf8_lossy(shown),
        "response"
    );

    Response::from_parts(parts, Body::from(bytes))
}
