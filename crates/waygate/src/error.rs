//! Error types for the gateway.
//!
//! One hierarchy serves every layer: transport failures, backend JSON-RPC
//! errors, policy denials, and front-end misconfiguration. The critical
//! conversion is [`GatewayError::to_rpc_error`], which turns any failure
//! into the JSON-RPC error object delivered to the client while preserving
//! backend `code`/`message`/`data` untouched.

use serde_json::{Value, json};
use thiserror::Error;
use waygate_protocol::jsonrpc::{JsonRpcError, error_codes};

/// Result type for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// Invalid gateway configuration (missing fields, malformed values)
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is wrong
        message: String,
        /// Offending configuration key, when known
        key: Option<String>,
    },

    /// Failed to establish a backend connection
    #[error("Backend connection error: {message}")]
    BackendConnection {
        /// What failed
        message: String,
        /// Backend identifier, when known
        backend: Option<String>,
    },

    /// Backend operation failed at the transport level
    #[error("Backend error: {message}")]
    Backend {
        /// What failed
        message: String,
        /// Operation in flight (method name), when known
        operation: Option<String>,
    },

    /// A JSON-RPC error object, either received from a backend verbatim or
    /// synthesized for an HTTP / transport failure
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i32,
        /// Error message
        message: String,
        /// Structured error data
        data: Option<Value>,
    },

    /// Tool call arrived before `sys___init` while DIFC is enforced
    #[error("sys___init must be called first")]
    SessionNotInitialized,

    /// The DIFC monitor denied the operation
    #[error("Policy violation ({component}): missing tags {missing:?}")]
    PolicyDenied {
        /// Violated label component: "secrecy" or "integrity"
        component: &'static str,
        /// Tags the agent lacks
        missing: Vec<String>,
        /// Resource description, for the structured reason
        resource: String,
    },

    /// Unknown tool name on a tool call
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// The gateway has already been shut down
    #[error("Gateway has already been closed")]
    AlreadyClosed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: None,
        }
    }

    /// Create a configuration error with key context
    pub fn configuration_with_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Create a backend connection error
    pub fn backend_connection(message: impl Into<String>) -> Self {
        Self::BackendConnection {
            message: message.into(),
            backend: None,
        }
    }

    /// Create a backend connection error naming the backend
    pub fn backend_connection_for(message: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::BackendConnection {
            message: message.into(),
            backend: Some(backend.into()),
        }
    }

    /// Create a backend operation error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a backend error with the method in flight
    pub fn backend_with_operation(
        message: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Wrap a backend JSON-RPC error object, preserving it field-for-field
    pub fn from_rpc(error: JsonRpcError) -> Self {
        Self::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }

    /// Synthesize the error for a non-2xx backend HTTP response.
    ///
    /// The message carries the decimal status; the body rides along as
    /// `data`, JSON-decoded when possible so every field the backend sent
    /// stays addressable.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let data = match serde_json::from_str::<Value>(body) {
            Ok(value) => value,
            Err(_) if body.is_empty() => Value::Null,
            Err(_) => Value::String(body.to_string()),
        };
        Self::Rpc {
            code: error_codes::SERVER_ERROR,
            message: format!("backend returned HTTP {status}"),
            data: if data.is_null() { None } else { Some(data) },
        }
    }

    /// Short machine-readable kind, used in structured log records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::BackendConnection { .. } => "backend_connection",
            Self::Backend { .. } => "backend",
            Self::Rpc { .. } => "rpc",
            Self::SessionNotInitialized => "session_not_initialized",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::UnknownTool(_) => "unknown_tool",
            Self::AlreadyClosed => "already_closed",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    /// Convert into the JSON-RPC error object delivered to the client.
    ///
    /// Backend `Rpc` errors pass through unchanged. Policy denials attach a
    /// structured reason so clients can distinguish the violated component.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Rpc {
                code,
                message,
                data,
            } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Self::PolicyDenied {
                component,
                missing,
                resource,
            } => JsonRpcError::with_data(
                error_codes::SERVER_ERROR,
                format!(
                    "policy violation: {component} check failed, missing tags {missing:?}"
                ),
                json!({
                    "component": component,
                    "missingTags": missing,
                    "resource": resource,
                }),
            ),
            Self::SessionNotInitialized => {
                JsonRpcError::new(error_codes::SERVER_ERROR, self.to_string())
            }
            Self::UnknownTool(_) => {
                JsonRpcError::new(error_codes::METHOD_NOT_FOUND, self.to_string())
            }
            Self::Serialization(_) => {
                JsonRpcError::new(error_codes::INVALID_PARAMS, self.to_string())
            }
            // Transport-level detail stays in the log; clients get a
            // generic failure naming the operation at most.
            Self::Backend { operation, .. } => JsonRpcError::new(
                error_codes::INTERNAL_ERROR,
                match operation {
                    Some(op) => format!("backend transport failure during {op}"),
                    None => "backend transport failure".to_string(),
                },
            ),
            Self::BackendConnection { backend, .. } => JsonRpcError::new(
                error_codes::INTERNAL_ERROR,
                match backend {
                    Some(backend) => format!("backend '{backend}' is unavailable"),
                    None => "backend is unavailable".to_string(),
                },
            ),
            other => JsonRpcError::new(error_codes::INTERNAL_ERROR, other.to_string()),
        }
    }
}
