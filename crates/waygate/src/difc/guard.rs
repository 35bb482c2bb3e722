//! Per-backend policy guards.
//!
//! A guard attaches labels to the resource a tool call is about to touch
//! and to the data it returns. Every backend has a guard; the default is a
//! pass-through that labels nothing, so the policy checks trivially pass
//! and no filtering happens.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::connection::Launcher;
use crate::difc::label::{LabeledData, LabeledResource, OperationKind};
use crate::error::GatewayResult;

/// Read-only backend access for guards that need metadata to label a
/// resource (for example, fetching a document's sensitivity marker).
///
/// Calls made through this handle bypass the policy monitor: re-entering
/// the monitor from inside an evaluation would deadlock on the agent's
/// label state. This is a trust boundary; guards are part of the policy
/// TCB and must only issue read-only metadata calls here.
pub struct BackendCaller {
    launcher: Arc<Launcher>,
    backend_id: String,
}

impl BackendCaller {
    /// Create a caller bound to one backend.
    pub fn new(launcher: Arc<Launcher>, backend_id: impl Into<String>) -> Self {
        Self {
            launcher,
            backend_id: backend_id.into(),
        }
    }

    /// The backend this caller reaches.
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Issue a raw JSON-RPC request to the backend, bypassing the monitor.
    ///
    /// # Errors
    ///
    /// Propagates connection and backend errors unchanged.
    pub async fn call(&self, method: &str, params: Option<Value>) -> GatewayResult<Value> {
        let connection = self.launcher.get_or_launch(&self.backend_id).await?;
        connection.send_request(method, params).await
    }
}

/// Per-backend policy hook.
#[async_trait]
pub trait Guard: Send + Sync {
    /// Label the resource a tool call is about to touch and classify the
    /// operation. Runs before the policy check; no backend call has been
    /// made for the tool yet.
    ///
    /// # Errors
    ///
    /// A guard error aborts the call before it reaches the backend.
    async fn label_resource(
        &self,
        tool_name: &str,
        arguments: Option<&Map<String, Value>>,
        caller: &BackendCaller,
    ) -> GatewayResult<LabeledResource>;

    /// Label the backend's response. `None` means the response carries no
    /// labels: nothing is filtered and nothing accumulates.
    ///
    /// # Errors
    ///
    /// A guard error fails the call after the backend already ran.
    async fn label_response(
        &self,
        tool_name: &str,
        result: &Value,
        caller: &BackendCaller,
    ) -> GatewayResult<Option<LabeledData>>;
}

/// The default guard: labels nothing, filters nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughGuard;

#[async_trait]
impl Guard for PassThroughGuard {
    async fn label_resource(
        &self,
        tool_name: &str,
        _arguments: Option<&Map<String, Value>>,
        _caller: &BackendCaller,
    ) -> GatewayResult<LabeledResource> {
        Ok(LabeledResource::unlabeled(
            tool_name,
            OperationKind::ReadWrite,
        ))
    }

    async fn label_response(
        &self,
        _tool_name: &str,
        _result: &Value,
        _caller: &BackendCaller,
    ) -> GatewayResult<Option<LabeledData>> {
        Ok(None)
    }
}

/// Registry of per-backend guards with a pass-through default.
pub struct GuardRegistry {
    guards: RwLock<HashMap<String, Arc<dyn Guard>>>,
    default: Arc<dyn Guard>,
}

impl Default for GuardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardRegistry {
    /// Create a registry where every backend gets the pass-through guard.
    pub fn new() -> Self {
        Self {
            guards: RwLock::new(HashMap::new()),
            default: Arc::new(PassThroughGuard),
        }
    }

    /// Install a custom guard for one backend.
    pub fn register(&self, backend_id: impl Into<String>, guard: Arc<dyn Guard>) {
        self.guards.write().insert(backend_id.into(), guard);
    }

    /// The guard for a backend; pass-through when none is registered.
    pub fn guard_for(&self, backend_id: &str) -> Arc<dyn Guard> {
        self.guards
            .read()
            .get(backend_id)
            .map_or_else(|| Arc::clone(&self.default), Arc::clone)
    }
}

impl std::fmt::Debug for GuardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardRegistry")
            .field("custom", &self.guards.read().len())
            .finish_non_exhaustive()
    }
}
