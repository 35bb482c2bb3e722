//! Input-schema normalization.
//!
//! Backends ship three malformed `inputSchema` shapes seen in the wild;
//! they are repaired here before a tool is published so strict MCP clients
//! do not reject the catalog.

use serde_json::Value;

/// Repair a tool input schema for publication.
///
/// - `{"type": "object"}` with no `properties` gains an empty `properties`
///   map; every other field is left untouched.
/// - A completely empty object `{}` passes through and means "no
///   parameters".
/// - A missing schema stays missing; clients infer no parameters.
///
/// The input is never mutated; a new value is returned. The function is
/// idempotent.
pub fn normalize_input_schema(schema: Option<&Value>) -> Option<Value> {
    let schema = schema?;
    let mut normalized = schema.clone();

    if let Value::Object(map) = &mut normalized
        && map.get("type").and_then(Value::as_str) == Some("object")
        && !map.contains_key("properties")
    {
        map.insert(
            "properties".to_string(),
            Value::Object(serde_json::Map::new()),
        );
    }

    Some(normalized)
}
