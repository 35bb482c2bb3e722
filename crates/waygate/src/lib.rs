//! waygate: an MCP protocol gateway
//!
//! MCP clients connect to the gateway over HTTP; the gateway fans requests
//! out to a configurable set of backend MCP servers reached over a
//! child-process stdio transport or a remote HTTP transport. It aggregates
//! the tool catalogs of all backends, multiplexes JSON-RPC requests across
//! them, and optionally interposes an information-flow control (DIFC)
//! policy layer on every tool invocation.
//!
//! # Quick Start
//!
//! ```bash
//! # Aggregate two backends behind one endpoint
//! waygate --config gateway.json --bind 127.0.0.1:8080
//! ```
//!
//! with `gateway.json`:
//!
//! ```json
//! {
//!   "servers": {
//!     "files": {"type": "stdio", "command": "python", "args": ["files_server.py"]},
//!     "github": {"type": "http", "url": "https://api.example.com/mcp"}
//!   }
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! client ── POST /mcp ──► auth ──► unified server ──► DIFC pipeline ──► backend
//!        ── POST /mcp/<backend> ──► routed subserver ──┘        (child process
//!                                                                or remote HTTP)
//! ```
//!
//! Two exposure modes share one tool registry and one set of backend
//! connections:
//!
//! - **Unified** (`/mcp`): tool names carry a `<backend>___` prefix.
//! - **Routed** (`/mcp/<backend>`): per-backend endpoints with original
//!   tool names, one cached subserver per `(backend, session)` pair.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod difc;
pub mod error;
pub mod http;
pub mod registry;
pub mod schema;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{BackendSpec, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
pub use server::GatewayServer;

/// Crate version, reported by `/health` as `gatewayVersion`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
