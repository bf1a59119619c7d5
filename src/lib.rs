//! mcp-gateway: a process gateway for Model Context Protocol tool servers
//!
//! The gateway launches MCP tool servers as child processes, speaks JSON-RPC
//! to them over stdio, and exposes them to many concurrent clients as
//! streaming sessions.
//!
//! # Architecture
//!
//! ```text
//!  client ──SSE/HTTP──▶ Gateway ──▶ SessionManager ──▶ Dispatcher
//!                                                        │    │
//!                                       ToolRegistry ◀───┘    ▼
//!                                                        Supervisor
//!                                                             │
//!                                                   ProcessHandle + ProtocolBridge
//!                                                             │ stdio
//!                                                        tool server
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types
//! - [`mcp`]: JSON-RPC envelopes, MCP payloads and line framing
//! - [`bridge`]: stdio ↔ JSON-RPC translation for one process
//! - [`supervisor`]: process launch, health checks and restarts
//! - [`registry`]: tool catalogs and argument validation
//! - [`session`]: streaming sessions, keepalive, reconnect and reaping
//! - [`gateway`]: request dispatch and the routing façade
//! - [`http`]: the axum HTTP surface

pub mod bridge;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod mcp;
pub mod registry;
pub mod session;
pub mod supervisor;
