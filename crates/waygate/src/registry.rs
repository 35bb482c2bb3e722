//! Tool registry: the aggregated catalog of every backend's tools.
//!
//! Tools are keyed by their prefixed name `<backend>___<original>`. The
//! registry is read-mostly after startup registration; writes happen only
//! during registration and deliberate test injection, so a reader/writer
//! lock fits the access pattern.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;
use waygate_protocol::types::Tool;

use crate::error::GatewayResult;
use crate::schema::normalize_input_schema;

/// Separator joining backend identifier and original tool name on the
/// unified endpoint. Part of the wire interface.
pub const TOOL_PREFIX_SEPARATOR: &str = "___";

/// Build the unified (prefixed) name for a backend tool.
pub fn prefixed_name(backend_id: &str, original_name: &str) -> String {
    format!("{backend_id}{TOOL_PREFIX_SEPARATOR}{original_name}")
}

/// One tool invocation as seen by a handler closure.
#[derive(Debug, Clone, Default)]
pub struct ToolCall {
    /// Stable client identity derived from the authorization header
    pub client_id: Option<String>,
    /// Tool arguments from the `tools/call` request
    pub arguments: Option<serde_json::Map<String, Value>>,
}

/// Handler closure stored on a tool record.
///
/// Captures its `(backend_id, original_name)` pair and routes the call
/// through the policy pipeline to the backend connection. The returned
/// value is the backend's `tools/call` result payload.
pub type ToolHandler =
    Arc<dyn Fn(ToolCall) -> BoxFuture<'static, GatewayResult<Value>> + Send + Sync>;

/// Registry record for one tool.
#[derive(Clone)]
pub struct ToolRecord {
    /// Prefixed tool name (registry key)
    pub name: String,
    /// Description, carrying the `[backend] ` prefix
    pub description: Option<String>,
    /// Normalized input schema
    pub input_schema: Option<Value>,
    /// Owning backend identifier
    pub backend_id: String,
    /// Handler closure bound to this tool
    pub handler: ToolHandler,
}

impl std::fmt::Debug for ToolRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRecord")
            .field("name", &self.name)
            .field("backend_id", &self.backend_id)
            .finish_non_exhaustive()
    }
}

/// Aggregated tool catalog.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolRecord>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a single record, replacing any previous one with the same
    /// name. Used by registration and by tests injecting fixtures.
    pub fn insert(&self, record: ToolRecord) {
        self.tools.write().insert(record.name.clone(), record);
    }

    /// Register every tool a backend reported from `tools/list`.
    ///
    /// Names gain the `<backend>___` prefix, descriptions the `[backend] `
    /// prefix, and schemas are normalized. `make_handler` is called with
    /// each original tool name to produce the bound handler closure.
    pub fn register_backend_tools(
        &self,
        backend_id: &str,
        tools: Vec<Tool>,
        make_handler: impl Fn(&str) -> ToolHandler,
    ) {
        let mut guard = self.tools.write();
        for tool in tools {
            let name = prefixed_name(backend_id, &tool.name);
            let description = format!(
                "[{backend_id}] {}",
                tool.description.as_deref().unwrap_or_default()
            );
            let record = ToolRecord {
                name: name.clone(),
                description: Some(description),
                input_schema: normalize_input_schema(tool.input_schema.as_ref()),
                backend_id: backend_id.to_string(),
                handler: make_handler(&tool.name),
            };
            guard.insert(name, record);
        }
        debug!(backend = backend_id, total = guard.len(), "tools registered");
    }

    /// All tools under their prefixed names, sorted for stable listings.
    pub fn unified_tools(&self) -> Vec<Tool> {
        let guard = self.tools.read();
        let mut tools: Vec<Tool> = guard
            .values()
            .map(|record| Tool {
                name: record.name.clone(),
                title: None,
                description: record.description.clone(),
                input_schema: record.input_schema.clone(),
                output_schema: None,
                annotations: None,
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Tools owned by one backend, names stripped of the backend prefix.
    ///
    /// The description keeps its `[backend] ` prefix as presentational
    /// metadata.
    pub fn tools_for_backend(&self, backend_id: &str) -> Vec<Tool> {
        let prefix = format!("{backend_id}{TOOL_PREFIX_SEPARATOR}");
        let guard = self.tools.read();
        let mut tools: Vec<Tool> = guard
            .values()
            .filter(|record| record.backend_id == backend_id)
            .map(|record| Tool {
                name: record
                    .name
                    .strip_prefix(&prefix)
                    .unwrap_or(&record.name)
                    .to_string(),
                title: None,
                description: record.description.clone(),
                input_schema: record.input_schema.clone(),
                output_schema: None,
                annotations: None,
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Handler for `(backend, original_name)`, if registered.
    pub fn handler(&self, backend_id: &str, original_name: &str) -> Option<ToolHandler> {
        let key = prefixed_name(backend_id, original_name);
        let guard = self.tools.read();
        guard
            .get(&key)
            .filter(|record| record.backend_id == backend_id)
            .map(|record| Arc::clone(&record.handler))
    }

    /// Handler for a prefixed (unified) tool name, if registered.
    pub fn handler_by_prefixed(&self, prefixed: &str) -> Option<ToolHandler> {
        self.tools
            .read()
            .get(prefixed)
            .map(|record| Arc::clone(&record.handler))
    }

    /// Record for a prefixed name, if registered.
    pub fn record(&self, prefixed: &str) -> Option<ToolRecord> {
        self.tools.read().get(prefixed).cloned()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Number of tools owned by one backend.
    pub fn backend_tool_count(&self, backend_id: &str) -> usize {
        self.tools
            .read()
            .values()
            .filter(|record| record.backend_id == backend_id)
            .count()
    }
}
