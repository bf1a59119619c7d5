//! Model Context Protocol (MCP) wire layer.
//!
//! The gateway sits between clients and tool-server processes and speaks
//! JSON-RPC 2.0 on both sides:
//!
//! ```text
//! ┌──────────┐   JSON-RPC    ┌───────────┐   JSON-RPC/stdio   ┌─────────────┐
//! │  Client  │──────────────▶│  Gateway  │───────────────────▶│ Tool server │
//! │ (stream) │◀──────────────│           │◀───────────────────│  (process)  │
//! └──────────┘               └───────────┘  one JSON per line └─────────────┘
//! ```
//!
//! - [`protocol`]: request, notification, response and error envelopes
//! - [`types`]: tool definitions, tool results and handshake payloads
//! - [`transport`]: newline-delimited framing over any async reader/writer
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05.

pub mod protocol;
pub mod transport;
pub mod types;

pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
pub use transport::LineTransport;
