//! Structural argument validation against a tool's input schema.
//!
//! Only the subset of JSON Schema that matters for routing is checked:
//! the arguments must be an object, every `required` field must be present,
//! and each supplied field with a declared primitive `type` must match it.
//! Types outside that set are accepted unchecked.

use serde_json::Value;

use crate::error::ValidationError;
use crate::mcp::types::Tool;

/// Validates `arguments` against `tool.input_schema`.
///
/// # Errors
///
/// Returns the first failure found, in the order: not an object, missing
/// required field, type mismatch.
pub fn validate_arguments(tool: &Tool, arguments: &Value) -> Result<(), ValidationError> {
    let Some(supplied) = arguments.as_object() else {
        return Err(ValidationError::NotAnObject {
            tool: tool.name.clone(),
        });
    };

    let schema = &tool.input_schema;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !supplied.contains_key(field) {
                return Err(ValidationError::MissingField {
                    tool: tool.name.clone(),
                    field: field.to_string(),
                });
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (field, value) in supplied {
        let Some(declared) = properties.get(field).and_then(|p| p.get("type")) else {
            continue;
        };
        if !matches_declared(declared, value) {
            return Err(ValidationError::TypeMismatch {
                tool: tool.name.clone(),
                field: field.clone(),
                expected: describe(declared),
                actual: json_type(value),
            });
        }
    }

    Ok(())
}

/// A declared type is either one name or a list of alternatives.
fn matches_declared(declared: &Value, value: &Value) -> bool {
    match declared {
        Value::String(name) => matches_type(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| matches_type(name, value)),
        _ => true,
    }
}

fn matches_type(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => is_integer(value),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn is_integer(value: &Value) -> bool {
    value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
}

fn describe(declared: &Value) -> String {
    match declared {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_file() -> Tool {
        Tool::new(
            "read_file",
            "Read a file",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "limit": {"type": "integer"},
                    "ratio": {"type": "number"},
                    "follow": {"type": "boolean"},
                    "tags": {"type": "array"},
                    "options": {"type": "object"},
                    "encoding": {"type": ["string", "null"]},
                    "custom": {"type": "x-custom"}
                },
                "required": ["path"]
            }),
        )
    }

    #[test]
    fn accepts_well_typed_arguments() {
        let args = json!({
            "path": "/tmp/a",
            "limit": 10,
            "ratio": 0.5,
            "follow": true,
            "tags": ["a"],
            "options": {},
            "encoding": null,
            "custom": 42,
            "undeclared": "anything"
        });
        assert_eq!(validate_arguments(&read_file(), &args), Ok(()));
    }

    #[test]
    fn rejects_non_object_arguments() {
        let err = validate_arguments(&read_file(), &json!(["path"])).unwrap_err();
        assert!(matches!(err, ValidationError::NotAnObject { .. }));
    }

    #[test]
    fn reports_missing_required_field() {
        let err = validate_arguments(&read_file(), &json!({"limit": 1})).unwrap_err();
        assert_eq!(err.field(), Some("path"));
        assert!(matches!(err, ValidationError::MissingField { .. }));
    }

    #[test]
    fn reports_type_mismatch_with_field() {
        let err = validate_arguments(&read_file(), &json!({"path": 7})).unwrap_err();
        assert_eq!(
            err,
            ValidationError::TypeMismatch {
                tool: "read_file".to_string(),
                field: "path".to_string(),
                expected: "string".to_string(),
                actual: "number",
            }
        );
    }

    #[test]
    fn integer_rejects_fractions() {
        let err = validate_arguments(&read_file(), &json!({"path": "a", "limit": 1.5})).unwrap_err();
        assert_eq!(err.field(), Some("limit"));
        assert!(validate_arguments(&read_file(), &json!({"path": "a", "limit": 2.0})).is_ok());
    }

    #[test]
    fn union_type_lists_alternatives() {
        let err = validate_arguments(&read_file(), &json!({"path": "a", "encoding": 3})).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::TypeMismatch { ref expected, .. } if expected == "string | null"
        ));
    }

    #[test]
    fn schema_without_properties_only_checks_required() {
        let tool = Tool::new("noop", "", json!({"type": "object"}));
        assert!(validate_arguments(&tool, &json!({"anything": 1})).is_ok());
    }
}
