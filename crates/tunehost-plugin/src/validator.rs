//! Shape checks applied to capability results before they leave the host.

use serde_json::{json, Map, Value};

use crate::capability::{Capability, ResultShape};
use crate::error::PluginError;

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Result returned when a plugin does not implement `capability`.
pub fn empty_result(capability: Capability) -> Value {
    match capability.result_shape() {
        ResultShape::SearchPage => json!({"isEnd": true, "data": []}),
        ResultShape::Sequence => json!([]),
        ResultShape::ObjectOrNull => Value::Null,
    }
}

/// Validate and normalize a raw capability result.
pub fn normalize(plugin: &str, capability: Capability, raw: Value) -> Result<Value, PluginError> {
    let invalid = |message: String| PluginError::InvalidResult {
        plugin: plugin.to_string(),
        action: capability.method().to_string(),
        message,
    };

    match capability.result_shape() {
        ResultShape::SearchPage => match raw {
            Value::Null => Ok(empty_result(capability)),
            Value::Array(items) => Ok(json!({"isEnd": true, "data": tag_items(plugin, items)})),
            Value::Object(page) => search_page(plugin, page).map_err(invalid),
            other => Err(invalid(format!("expected an object, got {}", kind(&other)))),
        },
        ResultShape::ObjectOrNull => match raw {
            Value::Null | Value::Object(_) | Value::Array(_) => Ok(raw),
            other => Err(invalid(format!(
                "expected an object or null, got {}",
                kind(&other)
            ))),
        },
        ResultShape::Sequence => match raw {
            Value::Null => Ok(Value::Array(Vec::new())),
            Value::Array(_) => Ok(raw),
            other => Err(invalid(format!("expected an array, got {}", kind(&other)))),
        },
    }
}

/// `isEnd` is false only when the plugin said exactly `false`.
fn search_page(plugin: &str, mut page: Map<String, Value>) -> Result<Value, String> {
    let data = match page.remove("data") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => tag_items(plugin, items),
        Some(other) => return Err(format!("search data must be an array, got {}", kind(&other))),
    };
    let is_end = !matches!(page.get("isEnd"), Some(Value::Bool(false)));
    page.insert("isEnd".into(), Value::Bool(is_end));
    page.insert("data".into(), Value::Array(data));
    Ok(Value::Object(page))
}

/// Attach the source plugin's name to every item. Non-object items are
/// dropped.
fn tag_items(plugin: &str, items: Vec<Value>) -> Vec<Value> {
    let total = items.len();
    let tagged: Vec<Value> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(mut fields) => {
                fields.insert("platform".into(), Value::String(plugin.to_string()));
                Some(Value::Object(fields))
            }
            _ => None,
        })
        .collect();
    if tagged.len() != total {
        tracing::warn!(
            plugin = %plugin,
            dropped = total - tagged.len(),
            "search returned non-object items"
        );
    }
    tagged
}
