//! The tool-call pipeline: policy enforcement around the backend call.
//!
//! Every tool handler closure routes through [`ToolPipeline::execute`].
//! With DIFC off only the backend call runs. With DIFC on the order is
//! strict: label the resource, check policy, call the backend, label the
//! response, filter collections, accumulate labels for reads. No backend
//! call happens before the policy check passes.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;
use waygate_protocol::types::methods;

use crate::connection::Launcher;
use crate::difc::{BackendCaller, GuardRegistry, LabeledData, PolicyMonitor};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{ToolCall, ToolHandler};

/// Shared state behind every tool handler closure.
pub struct ToolPipeline {
    launcher: Arc<Launcher>,
    guards: Arc<GuardRegistry>,
    monitor: Arc<PolicyMonitor>,
    difc_enabled: bool,
}

impl ToolPipeline {
    /// Wire the pipeline.
    pub fn new(
        launcher: Arc<Launcher>,
        guards: Arc<GuardRegistry>,
        monitor: Arc<PolicyMonitor>,
        difc_enabled: bool,
    ) -> Self {
        Self {
            launcher,
            guards,
            monitor,
            difc_enabled,
        }
    }

    /// The launcher backing this pipeline.
    pub fn launcher(&self) -> &Arc<Launcher> {
        &self.launcher
    }

    /// The policy monitor backing this pipeline.
    pub fn monitor(&self) -> &Arc<PolicyMonitor> {
        &self.monitor
    }

    /// Build the handler closure for one `(backend, original-name)` pair.
    pub fn handler_for(self: &Arc<Self>, backend_id: &str, original_name: &str) -> ToolHandler {
        let pipeline = Arc::clone(self);
        let backend_id = backend_id.to_string();
        let original_name = original_name.to_string();
        Arc::new(move |call: ToolCall| {
            let pipeline = Arc::clone(&pipeline);
            let backend_id = backend_id.clone();
            let original_name = original_name.clone();
            Box::pin(async move { pipeline.execute(&backend_id, &original_name, call).await })
        })
    }

    /// Run one tool invocation through the pipeline.
    ///
    /// # Errors
    ///
    /// Propagates policy denials, guard failures, and backend errors; the
    /// caller converts them into JSON-RPC error responses.
    pub async fn execute(
        &self,
        backend_id: &str,
        tool_name: &str,
        call: ToolCall,
    ) -> GatewayResult<Value> {
        if !self.difc_enabled {
            return self.call_backend(backend_id, tool_name, &call).await;
        }

        // Agent resolution: the session id is the agent identity.
        let agent_id = call
            .client_id
            .clone()
            .ok_or(GatewayError::SessionNotInitialized)?;

        let guard = self.guards.guard_for(backend_id);
        let caller = BackendCaller::new(Arc::clone(&self.launcher), backend_id);

        // Pre-call labeling, then the coarse policy check. Denial
        // short-circuits before any backend traffic for this tool.
        let resource = guard
            .label_resource(tool_name, call.arguments.as_ref(), &caller)
            .await?;
        self.monitor.check(&agent_id, &resource)?;

        let result = self.call_backend(backend_id, tool_name, &call).await?;

        // Post-call labeling and fine-grained filtering.
        let labeled = guard.label_response(tool_name, &result, &caller).await?;
        let accumulate = resource.operation.reads();
        let result = match labeled {
            None => {
                if accumulate {
                    self.monitor
                        .absorb(&agent_id, &resource.secrecy, &resource.integrity);
                }
                result
            }
            Some(LabeledData::Single(item)) => {
                if accumulate {
                    self.monitor.absorb(&agent_id, &item.secrecy, &item.integrity);
                }
                result
            }
            Some(LabeledData::Collection(collection)) => {
                let outcome =
                    self.monitor
                        .filter_collection(&agent_id, &collection, accumulate);
                debug!(
                    backend = backend_id,
                    tool = tool_name,
                    accessible = outcome.accessible,
                    filtered = outcome.filtered,
                    "tool result filtered"
                );
                rebuild_filtered_result(&result, outcome.kept)
            }
        };

        Ok(result)
    }

    /// Forward the `tools/call` to the backend connection, with the client
    /// session attached for remote-http transports.
    async fn call_backend(
        &self,
        backend_id: &str,
        tool_name: &str,
        call: &ToolCall,
    ) -> GatewayResult<Value> {
        let connection = self.launcher.get_or_launch(backend_id).await?;
        let mut params = json!({ "name": tool_name });
        if let Some(arguments) = &call.arguments {
            params["arguments"] = Value::Object(arguments.clone());
        }
        connection
            .send_request_with_session(methods::TOOLS_CALL, Some(params), call.client_id.as_deref())
            .await
    }
}

impl std::fmt::Debug for ToolPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolPipeline")
            .field("difc_enabled", &self.difc_enabled)
            .finish_non_exhaustive()
    }
}

/// Rebuild a tool result after collection filtering: the guard's kept item
/// values replace the result's `content` sequence.
fn rebuild_filtered_result(original: &Value, kept: Vec<Value>) -> Value {
    match original {
        Value::Object(map) => {
            let mut rebuilt = map.clone();
            rebuilt.insert("content".to_string(), Value::Array(kept));
            Value::Object(rebuilt)
        }
        _ => json!({ "content": kept }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendSpec, GatewayConfig};
    use crate::difc::{
        CollectionLabeledData, Guard, Label, LabeledItem, LabeledResource, OperationKind,
    };
    use async_trait::async_trait;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::Map;
    use std::collections::BTreeMap;

    /// Fake backend whose tools/call echoes a fixed result.
    async fn fake_backend(result: Value) -> String {
        let router = Router::new().route(
            "/mcp",
            post(move |Json(body): Json<Value>| {
                let result = result.clone();
                async move {
                    match body.get("id") {
                        None => axum::http::StatusCode::ACCEPTED.into_response(),
                        Some(id) => {
                            let payload = if body["method"] == json!("initialize") {
                                json!({
                                    "protocolVersion": "2025-06-18",
                                    "capabilities": {"tools": {}},
                                    "serverInfo": {"name": "fake", "version": "0"}
                                })
                            } else {
                                result
                            };
                            Json(json!({"jsonrpc": "2.0", "id": id, "result": payload}))
                                .into_response()
                        }
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/mcp")
    }

    fn pipeline_for(url: &str, difc: bool) -> Arc<ToolPipeline> {
        let mut config = GatewayConfig::default();
        config.servers.insert(
            "b".to_string(),
            BackendSpec::Http {
                url: url.to_string(),
                headers: BTreeMap::new(),
            },
        );
        Arc::new(ToolPipeline::new(
            Arc::new(Launcher::new(&config)),
            Arc::new(GuardRegistry::new()),
            Arc::new(PolicyMonitor::new()),
            difc,
        ))
    }

    fn call_with_client(client: &str) -> ToolCall {
        ToolCall {
            client_id: Some(client.to_string()),
            arguments: Some(Map::new()),
        }
    }

    #[tokio::test]
    async fn test_difc_off_forwards_result_unchanged() {
        let url = fake_backend(json!({"content": [{"type": "text", "text": "hi"}]})).await;
        let pipeline = pipeline_for(&url, false);

        let result = pipeline
            .execute("b", "echo", ToolCall::default())
            .await
            .unwrap();
        assert_eq!(result, json!({"content": [{"type": "text", "text": "hi"}]}));
    }

    #[tokio::test]
    async fn test_difc_on_requires_an_agent() {
        let url = fake_backend(json!({"content": []})).await;
        let pipeline = pipeline_for(&url, true);

        let err = pipeline
            .execute("b", "echo", ToolCall::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotInitialized));
    }

    #[tokio::test]
    async fn test_pass_through_guard_lets_calls_flow() {
        let url = fake_backend(json!({"content": [{"type": "text", "text": "ok"}]})).await;
        let pipeline = pipeline_for(&url, true);

        let result = pipeline
            .execute("b", "echo", call_with_client("alice"))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], json!("ok"));
    }

    /// Guard denying reads of "secret"-labeled tools until the tag is held.
    struct SecretGuard;

    #[async_trait]
    impl Guard for SecretGuard {
        async fn label_resource(
            &self,
            tool_name: &str,
            _arguments: Option<&Map<String, Value>>,
            _caller: &BackendCaller,
        ) -> GatewayResult<LabeledResource> {
            Ok(LabeledResource {
                description: tool_name.to_string(),
                secrecy: Label::from_tags(["secret"]),
                integrity: Label::empty(),
                operation: OperationKind::Read,
            })
        }

        async fn label_response(
            &self,
            _tool_name: &str,
            result: &Value,
            _caller: &BackendCaller,
        ) -> GatewayResult<Option<LabeledData>> {
            let items = result["content"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, value)| LabeledItem {
                    value,
                    secrecy: if i == 0 {
                        Label::empty()
                    } else {
                        Label::from_tags(["ultra"])
                    },
                    integrity: Label::empty(),
                })
                .collect();
            Ok(Some(LabeledData::Collection(CollectionLabeledData {
                items,
                secrecy: Label::empty(),
                integrity: Label::empty(),
            })))
        }
    }

    #[tokio::test]
    async fn test_denial_short_circuits_before_backend() {
        let url = fake_backend(json!({"content": []})).await;
        let mut config = GatewayConfig::default();
        config.servers.insert(
            "b".to_string(),
            BackendSpec::Http {
                url,
                headers: BTreeMap::new(),
            },
        );
        let guards = Arc::new(GuardRegistry::new());
        guards.register("b", Arc::new(SecretGuard));
        let monitor = Arc::new(PolicyMonitor::new());
        let pipeline = Arc::new(ToolPipeline::new(
            Arc::new(Launcher::new(&config)),
            guards,
            Arc::clone(&monitor),
            true,
        ));

        let err = pipeline
            .execute("b", "read_doc", call_with_client("alice"))
            .await
            .unwrap_err();
        match err {
            GatewayError::PolicyDenied {
                component, missing, ..
            } => {
                assert_eq!(component, "secrecy");
                assert_eq!(missing, vec!["secret".to_string()]);
            }
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_labeled_collections_are_filtered_and_accumulated() {
        let url = fake_backend(json!({
            "content": [
                {"type": "text", "text": "public"},
                {"type": "text", "text": "classified"}
            ]
        }))
        .await;
        let mut config = GatewayConfig::default();
        config.servers.insert(
            "b".to_string(),
            BackendSpec::Http {
                url,
                headers: BTreeMap::new(),
            },
        );
        let guards = Arc::new(GuardRegistry::new());
        guards.register("b", Arc::new(SecretGuard));
        let monitor = Arc::new(PolicyMonitor::new());
        let pipeline = Arc::new(ToolPipeline::new(
            Arc::new(Launcher::new(&config)),
            guards,
            Arc::clone(&monitor),
            true,
        ));

        // Grant the read capability first.
        monitor.absorb("alice", &Label::from_tags(["secret"]), &Label::empty());

        let result = pipeline
            .execute("b", "read_doc", call_with_client("alice"))
            .await
            .unwrap();
        // The "ultra"-labeled second item was dropped.
        let content = result["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["text"], json!("public"));
    }

    /// Guard that derives labels from backend metadata fetched through the
    /// monitor-bypassing caller.
    struct MetadataGuard;

    #[async_trait]
    impl Guard for MetadataGuard {
        async fn label_resource(
            &self,
            tool_name: &str,
            _arguments: Option<&Map<String, Value>>,
            caller: &BackendCaller,
        ) -> GatewayResult<LabeledResource> {
            // An inner read-only call; it must not re-enter the monitor.
            let listing = caller.call("tools/list", None).await?;
            let known = listing["tools"]
                .as_array()
                .is_some_and(|tools| tools.iter().any(|t| t["name"] == json!(tool_name)));
            Ok(LabeledResource {
                description: tool_name.to_string(),
                secrecy: if known {
                    Label::empty()
                } else {
                    Label::from_tags(["unlisted"])
                },
                integrity: Label::empty(),
                operation: OperationKind::Read,
            })
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

    #[tokio::test]
    async fn test_guard_metadata_calls_bypass_the_monitor() {
        let url = fake_backend(json!({"content": [{"type": "text", "text": "ok"}]})).await;
        let mut config = GatewayConfig::default();
        config.servers.insert(
            "b".to_string(),
            BackendSpec::Http {
                url,
                headers: BTreeMap::new(),
            },
        );
        let guards = Arc::new(GuardRegistry::new());
        guards.register("b", Arc::new(MetadataGuard));
        let pipeline = Arc::new(ToolPipeline::new(
            Arc::new(Launcher::new(&config)),
            guards,
            Arc::new(PolicyMonitor::new()),
            true,
        ));

        // The fake backend's tools/list answers with the generic result, so
        // the tool is "unlisted" and the empty-labeled agent is denied; the
        // metadata call itself went through without a policy check.
        let err = pipeline
            .execute("b", "echo", call_with_client("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PolicyDenied { .. }));
    }

    #[test]
    fn test_rebuild_replaces_content_and_keeps_other_fields() {
        let original = json!({"content": [1, 2, 3], "isError": false});
        let rebuilt = rebuild_filtered_result(&original, vec![json!(1)]);
        assert_eq!(rebuilt, json!({"content": [1], "isError": false}));
    }

    #[tokio::test]
    async fn test_handler_closure_is_bound_to_its_pair() {
        let url = fake_backend(json!({"content": [{"type": "text", "text": "bound"}]})).await;
        let pipeline = pipeline_for(&url, false);

        let handler = pipeline.handler_for("b", "echo");
        let result = handler(ToolCall::default()).await.unwrap();
        assert_eq!(result["content"][0]["text"], json!("bound"));
    }
}
