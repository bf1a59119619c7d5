//! Error types for mcp-gateway.
//!
//! # Security Note
//!
//! Error messages are carefully crafted to NEVER include credentials.
//! Launch parameters (arguments, environment) arrive decrypted from the
//! configuration collaborator, so no variant carries them; spawn failures
//! report the OS reason and the logical server name only.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp::protocol::{ErrorCode, JsonRpcError, JsonRpcErrorData, RequestId};

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Tool argument validation failures.
///
/// Every variant names the offending tool or field so the client can
/// correct the call without guessing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The tool is not in the server's catalog.
    #[error("unknown tool: '{tool}'")]
    UnknownTool {
        /// Requested tool name.
        tool: String,
    },

    /// The arguments value is not a JSON object.
    #[error("arguments for '{tool}' must be an object")]
    NotAnObject {
        /// Tool being called.
        tool: String,
    },

    /// A field listed in the schema's `required` array is absent.
    #[error("missing required field '{field}' for tool '{tool}'")]
    MissingField {
        /// Tool being called.
        tool: String,
        /// The absent field.
        field: String,
    },

    /// A supplied field does not match its declared type.
    #[error("field '{field}' for tool '{tool}' must be of type {expected}, got {actual}")]
    TypeMismatch {
        /// Tool being called.
        tool: String,
        /// The offending field.
        field: String,
        /// Declared schema type.
        expected: String,
        /// Runtime JSON type that was supplied.
        actual: &'static str,
    },
}

impl ValidationError {
    /// The offending field, when the failure concerns one.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingField { field, .. } | Self::TypeMismatch { field, .. } => Some(field),
            Self::UnknownTool { .. } | Self::NotAnObject { .. } => None,
        }
    }

    /// Converts the failure into a JSON-RPC error for the given request.
    ///
    /// Unknown tools use `-32601`; everything else is `-32602`.
    #[must_use]
    pub fn rpc_error(&self, id: RequestId) -> JsonRpcError {
        let (code, data) = match self {
            Self::UnknownTool { tool } => (ErrorCode::MethodNotFound, json!({ "tool": tool })),
            Self::NotAnObject { tool } => (ErrorCode::InvalidParams, json!({ "tool": tool })),
            Self::MissingField { tool, field } | Self::TypeMismatch { tool, field, .. } => (
                ErrorCode::InvalidParams,
                json!({ "tool": tool, "field": field }),
            ),
        };
        JsonRpcError::new(
            Some(id),
            JsonRpcErrorData::with_message(code, self.to_string()).with_data(data),
        )
    }
}

/// Runtime errors raised by the supervisor, the protocol bridge and the
/// tool registry.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The process could not be started.
    #[error("failed to spawn server '{server}': {reason}")]
    SpawnError {
        /// Logical server name.
        server: String,
        /// OS-level reason.
        reason: String,
    },

    /// The process's pipes closed (the process exited or crashed).
    #[error("server '{server}' process is gone")]
    ProcessGone {
        /// Logical server name.
        server: String,
    },

    /// No response arrived within the deadline.
    #[error("server '{server}' did not answer '{method}' within {}ms", timeout.as_millis())]
    Timeout {
        /// Logical server name.
        server: String,
        /// The method that timed out.
        method: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The process wrote something that is not valid JSON-RPC.
    #[error("protocol violation from server '{server}': {reason}")]
    ProtocolError {
        /// Logical server name.
        server: String,
        /// What was wrong with the message.
        reason: String,
    },

    /// Tool arguments failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The server reached its restart ceiling or has auto-restart disabled.
    #[error("server '{server}' exceeded its restart limit after {attempts} restarts")]
    RestartLimitExceeded {
        /// Logical server name.
        server: String,
        /// Restarts performed before giving up.
        attempts: u32,
    },

    /// No configuration exists for the requested server.
    #[error("unknown server: '{server}'")]
    UnknownServer {
        /// Requested server name.
        server: String,
    },

    /// The server exists but is disabled in configuration.
    #[error("server '{server}' is disabled")]
    ServerDisabled {
        /// Logical server name.
        server: String,
    },

    /// A session lookup or submission failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Neither a live session nor a known server was given.
    #[error("no live session or server to route the message to")]
    NoRoute,

    /// The process answered with its own JSON-RPC error.
    #[error("server error [{code}]: {message}")]
    Upstream {
        /// Error code reported by the process.
        code: i32,
        /// Error message reported by the process.
        message: String,
        /// Optional structured data reported by the process.
        data: Option<Value>,
    },
}

impl GatewayError {
    /// Returns true for failures that indicate the process itself is
    /// unhealthy and should be considered for restart.
    #[must_use]
    pub const fn is_process_failure(&self) -> bool {
        matches!(
            self,
            Self::ProcessGone { .. } | Self::Timeout { .. } | Self::ProtocolError { .. }
        )
    }

    /// Converts the error into a well-formed JSON-RPC error response.
    ///
    /// Only the human-readable message crosses the wire; process-originated
    /// errors keep their own code.
    #[must_use]
    pub fn rpc_error(&self, id: RequestId) -> JsonRpcError {
        match self {
            Self::Validation(err) => err.rpc_error(id),
            Self::Upstream {
                code,
                message,
                data,
            } => JsonRpcError::new(
                Some(id),
                JsonRpcErrorData {
                    code: *code,
                    message: message.clone(),
                    data: data.clone(),
                },
            ),
            _ => JsonRpcError::internal_error(id, self.to_string()),
        }
    }
}

/// Session bookkeeping failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No metadata exists for the session (never created, or reaped).
    #[error("session not found: {session_id}")]
    NotFound {
        /// Requested session id.
        session_id: String,
    },

    /// The session exists but its client stream is gone.
    #[error("session {session_id} is not active")]
    Inactive {
        /// Requested session id.
        session_id: String,
    },

    /// The session used up its reconnect budget.
    #[error("session {session_id} exceeded {limit} reconnect attempts")]
    ReconnectLimit {
        /// Requested session id.
        session_id: String,
        /// Configured maximum.
        limit: u32,
    },

    /// The session's inbound queue is closed or full.
    #[error("session {session_id} is not accepting messages")]
    Backpressure {
        /// Requested session id.
        session_id: String,
    },
}
