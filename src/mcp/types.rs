//! MCP payload types shared by the bridge, the registry and the dispatcher.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::mcp::protocol::{GATEWAY_NAME, MCP_PROTOCOL_VERSION};

static TOOL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("tool name pattern is valid"));

/// Returns true if `name` is an acceptable tool name.
#[must_use]
pub fn is_valid_tool_name(name: &str) -> bool {
    TOOL_NAME.is_match(name)
}

/// A tool definition as advertised in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

impl Tool {
    /// Creates a tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        }
    }
}

fn empty_object_schema() -> Value {
    json!({ "type": "object" })
}

/// Parameters for a `tools/call` request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    /// Name of the tool to call.
    pub name: String,
    /// Arguments for the tool.
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    json!({})
}

/// Checks that a `tools/call` result has the shape clients expect.
///
/// The value itself is forwarded untouched, so fields and content types the
/// gateway does not know about survive the trip.
pub fn check_tool_result(result: &Value) -> Result<(), &'static str> {
    let Some(object) = result.as_object() else {
        return Err("tool result must be an object");
    };
    if let Some(content) = object.get("content") {
        let Some(items) = content.as_array() else {
            return Err("tool result content must be an array");
        };
        let tagged = items
            .iter()
            .all(|item| item.get("type").is_some_and(Value::is_string));
        if !tagged {
            return Err("every content item needs a string type");
        }
    }
    if object.get("isError").is_some_and(|flag| !flag.is_boolean()) {
        return Err("tool result isError must be a boolean");
    }
    Ok(())
}

/// Client or server identification exchanged during `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Name.
    pub name: String,
    /// Version.
    #[serde(default = "unknown_version")]
    pub version: String,
}

impl Implementation {
    /// The gateway's own identification.
    #[must_use]
    pub fn gateway() -> Self {
        Self {
            name: GATEWAY_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn unknown_version() -> String {
    "unknown".to_string()
}

/// Builds the `initialize` request parameters sent to a process.
#[must_use]
pub fn initialize_params(client_info: &Implementation) -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": client_info,
    })
}

/// Fills the fields every `initialize` result must carry.
///
/// Some tool servers answer the handshake with a bare `{}`; clients still
/// expect `protocolVersion`, `serverInfo` and `capabilities`.
#[must_use]
pub fn normalise_initialize_result(result: Value, server_name: &str) -> Value {
    let mut object = match result {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    object
        .entry("protocolVersion")
        .or_insert_with(|| json!(MCP_PROTOCOL_VERSION));
    object.entry("serverInfo").or_insert_with(|| {
        json!({ "name": server_name, "version": unknown_version() })
    });
    object
        .entry("capabilities")
        .or_insert_with(|| json!({ "tools": {} }));
    Value::Object(object)
}
