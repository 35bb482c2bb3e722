//! Authorization middleware.
//!
//! When an API key is configured every endpoint except `/health` is
//! protected. The rules are strict and ordered: query-string credentials
//! are rejected outright, the bearer scheme is case-sensitive, and the
//! token is compared in constant time.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::server::GatewayServer;

/// Query parameters that must never carry credentials.
const FORBIDDEN_QUERY_KEYS: &[&str] = &["token", "access_token", "apiKey"];

/// A rejected request: status plus plain-text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRejection {
    /// HTTP status (400 or 401)
    pub status: u16,
    /// Plain-text body; 401 bodies start with "Unauthorized"
    pub body: String,
}

impl AuthRejection {
    fn unauthorized(detail: &str) -> Self {
        Self {
            status: 401,
            body: format!("Unauthorized: {detail}"),
        }
    }

    fn bad_request(detail: &str) -> Self {
        Self {
            status: 400,
            body: format!("Bad Request: {detail}"),
        }
    }
}

/// Apply the authorization rules for one request.
///
/// `auth_header` is the first `Authorization` header value, if any.
///
/// # Errors
///
/// Returns the rejection to serve when the request must not proceed.
pub fn authorize(
    api_key: Option<&str>,
    query: Option<&str>,
    auth_header: Option<&str>,
) -> Result<(), AuthRejection> {
    let Some(api_key) = api_key else {
        return Ok(());
    };

    if let Some(query) = query
        && query_carries_credentials(query)
    {
        return Err(AuthRejection::bad_request(
            "credentials must not be passed in the query string",
        ));
    }

    let Some(header) = auth_header else {
        return Err(AuthRejection::unauthorized("missing Authorization header"));
    };

    // The bearer scheme is case-sensitive: "bearer" is malformed.
    let Some(raw_token) = header.strip_prefix("Bearer ") else {
        return Err(AuthRejection::bad_request(
            "Authorization header must use the Bearer scheme",
        ));
    };

    let token = raw_token.trim();
    if token.is_empty() {
        return Err(AuthRejection::bad_request("empty bearer token"));
    }

    if token.as_bytes().ct_eq(api_key.as_bytes()).into() {
        Ok(())
    } else {
        Err(AuthRejection::unauthorized("invalid API key"))
    }
}

/// Whether the query string carries any of the forbidden credential keys.
fn query_carries_credentials(query: &str) -> bool {
    url::form_urlencoded::parse(query.as_bytes())
        .any(|(key, _)| FORBIDDEN_QUERY_KEYS.contains(&key.as_ref()))
}

/// Axum middleware enforcing [`authorize`] on everything except `/health`.
pub async fn auth_middleware(
    State(server): State<Arc<GatewayServer>>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let decision = authorize(
        server.config().api_key.as_deref(),
        request.uri().query(),
        auth_header,
    );
    match decision {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            debug!(
                path = %request.uri().path(),
                method = %request.method(),
                status = rejection.status,
                "request rejected by authorization"
            );
            (
                StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::UNAUTHORIZED),
                rejection.body,
            )
                .into_response()
        }
    }
}
