//! Gateway configuration.
//!
//! Loaded once at startup from a JSON file and treated as immutable for the
//! life of the process. Backend identifiers double as tool-name prefixes and
//! URL path segments, so validation is strict about their charset.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{GatewayError, GatewayResult};

/// Default bind address (localhost only)
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";

/// Backend identifier reserved for the built-in sys tools
pub const SYS_BACKEND_ID: &str = "sys";

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Configured backends, keyed by backend identifier
    #[serde(default)]
    pub servers: BTreeMap<String, BackendSpec>,

    /// Whether the DIFC policy layer and the built-in sys tools are active
    #[serde(default, rename = "enableDIFC")]
    pub enable_difc: bool,

    /// API key protecting every endpoint except /health
    #[serde(default, rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            enable_difc: false,
            api_key: None,
            bind: default_bind(),
        }
    }
}

/// Backend descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendSpec {
    /// Child process speaking newline-delimited JSON-RPC on its stdio
    Stdio {
        /// Executable to spawn
        command: String,
        /// Command arguments
        #[serde(default)]
        args: Vec<String>,
    },
    /// Remote MCP server reached over HTTP POST
    Http {
        /// Endpoint URL
        url: String,
        /// Fixed headers added to every request (auth tokens, tenant ids)
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl GatewayConfig {
    /// Load configuration from a JSON file and validate it.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` when the file cannot be read,
    /// parsed, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::configuration(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate backend identifiers and descriptors.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` naming the offending key.
    pub fn validate(&self) -> GatewayResult<()> {
        for (id, spec) in &self.servers {
            if id.is_empty() {
                return Err(GatewayError::configuration_with_key(
                    "backend identifier must not be empty",
                    "servers",
                ));
            }
            if id == SYS_BACKEND_ID {
                return Err(GatewayError::configuration_with_key(
                    format!("backend identifier '{SYS_BACKEND_ID}' is reserved"),
                    format!("servers.{id}"),
                ));
            }
            if !is_valid_backend_id(id) {
                return Err(GatewayError::configuration_with_key(
                    format!(
                        "backend identifier '{id}' must match [A-Za-z0-9_-]+ \
                         (it is used in URL paths and tool-name prefixes)"
                    ),
                    format!("servers.{id}"),
                ));
            }

            match spec {
                BackendSpec::Stdio { command, .. } => {
                    if command.is_empty() {
                        return Err(GatewayError::configuration_with_key(
                            "stdio backend requires a command",
                            format!("servers.{id}.command"),
                        ));
                    }
                }
                BackendSpec::Http { url, .. } => {
                    let parsed = url::Url::parse(url).map_err(|e| {
                        GatewayError::configuration_with_key(
                            format!("invalid URL: {e}"),
                            format!("servers.{id}.url"),
                        )
                    })?;
                    if parsed.scheme() != "http" && parsed.scheme() != "https" {
                        return Err(GatewayError::configuration_with_key(
                            format!("unsupported URL scheme '{}'", parsed.scheme()),
                            format!("servers.{id}.url"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Backend identifiers in deterministic order
    pub fn backend_ids(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }
}

/// Backend identifiers appear in URL paths and tool prefixes; restrict them
/// to a path-safe charset with no separator collisions.
fn is_valid_backend_id(id: &str) -> bool {
    !id.contains("___")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
