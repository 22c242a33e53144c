//! Tool-call argument validation against a declared JSON schema.
//!
//! Covers the subset of JSON Schema used by tool declarations: an object with
//! `properties`, `required`, and primitive `type`s.

use serde_json::Value;

use crate::{ProviderError, ToolDefinition};

/// Check a tool call against the declared tools.
pub fn validate_tool_call(
    tools: &[ToolDefinition],
    name: &str,
    args: &Value,
) -> Result<(), ProviderError> {
    let Some(tool) = tools.iter().find(|t| t.name == name) else {
        return Err(ProviderError::MalformedToolCall {
            tool: name.to_string(),
            reason: "tool is not declared".into(),
        });
    };
    validate_arguments(&tool.parameters_schema, args).map_err(|reason| {
        ProviderError::MalformedToolCall {
            tool: name.to_string(),
            reason,
        }
    })
}

/// Validate `args` against an object schema, returning the first violation.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(object) = args.as_object() else {
        return Err(format!("arguments must be an object, got {}", type_name(args)));
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            match object.get(key) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required argument '{key}'"));
                }
                _ => {}
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in object {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if !matches_type(expected, value) {
                return Err(format!(
                    "argument '{key}' must be {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
