//! waygate-protocol: JSON-RPC 2.0 envelope and MCP wire types
//!
//! The wire vocabulary shared by every waygate transport and server layer.
//! Two modules:
//!
//! - [`jsonrpc`]: the JSON-RPC 2.0 envelope (requests, responses,
//!   notifications, error objects, standard error codes).
//! - [`types`]: the MCP payload types the gateway forwards (initialization,
//!   tool catalogs, tool calls, content blocks).
//!
//! Tool input schemas are deliberately kept as raw [`serde_json::Value`]s:
//! the gateway republishes backend schemas and must preserve fields it does
//! not understand.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod jsonrpc;
pub mod types;

pub use jsonrpc::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload,
    RequestId, ResponseId, error_codes,
};
pub use types::{
    CallToolRequest, CallToolResult, ContentBlock, Implementation, InitializeResult,
    ListToolsResult, PROTOCOL_VERSION, ServerCapabilities, TextContent, Tool, ToolsCapability,
};
