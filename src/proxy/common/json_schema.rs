use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Keys the upstream accepts in a function declaration schema. Everything
/// else is stripped: the v1internal validator rejects draft keywords
/// (`$schema`, `additionalProperties`, `format`, `default`, …) outright.
const ALLOWED_KEYS: [&str; 6] = [
    "type",
    "properties",
    "required",
    "items",
    "enum",
    "description",
];

/// Reduce an arbitrary JSON-Schema fragment to the strict subset the
/// upstream accepts. Idempotent: sanitizing an already-sanitized schema is
/// a no-op.
///
/// 1. Inline `$ref` targets from `$defs`/`definitions`.
/// 2. Collapse `oneOf`/`anyOf`/`allOf` to their first branch.
/// 3. Collapse union types (`["string","null"]` -> `"string"`) and lowercase.
/// 4. Prune `required` names that have no matching property.
/// 5. Drop every key outside the allowed subset.
pub fn sanitize_tool_schema(value: &mut Value) {
    if let Value::Object(map) = value {
        let mut defs = serde_json::Map::new();
        if let Some(Value::Object(d)) = map.remove("$defs") {
            defs.extend(d);
        }
        if let Some(Value::Object(d)) = map.remove("definitions") {
            defs.extend(d);
        }

        if !defs.is_empty() {
            inline_refs(map, &defs);
        }
    }

    sanitize_schema_node(value);
}

/// Replace `$ref` nodes with their definitions. Tool schemas are DAGs in
/// practice; a cyclic reference would already have been rejected upstream.
fn inline_refs(map: &mut serde_json::Map<String, Value>, defs: &serde_json::Map<String, Value>) {
    if let Some(Value::String(ref_path)) = map.remove("$ref") {
        let ref_name = ref_path.split('/').next_back().unwrap_or(&ref_path);

        if let Some(Value::Object(def_map)) = defs.get(ref_name) {
            for (k, v) in def_map {
                map.entry(k.clone()).or_insert_with(|| v.clone());
            }
            inline_refs(map, defs);
        }
    }

    for (_, v) in map.iter_mut() {
        if let Value::Object(child) = v {
            inline_refs(child, defs);
        } else if let Value::Array(arr) = v {
            for item in arr {
                if let Value::Object(child) = item {
                    inline_refs(child, defs);
                }
            }
        }
    }
}

/// Sanitize one schema node. Recursion is structure-aware: only positions
/// that actually hold schemas (`properties` values, `items`, combinator
/// branches) are treated as schemas, so a property literally named "enum"
/// or "type" survives.
fn sanitize_schema_node(value: &mut Value) {
    let Value::Object(map) = value else { return };

    // Combinators: the upstream supports none of them, keep the first branch
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(Value::Array(branches)) = map.remove(combinator) {
            if let Some(Value::Object(first)) = branches.into_iter().next() {
                for (k, v) in first {
                    map.entry(k).or_insert(v);
                }
            }
        }
    }

    // Union types collapse to the first non-null member, lowercased
    if let Some(type_val) = map.get_mut("type") {
        match type_val {
            Value::String(s) => *type_val = Value::String(s.to_lowercase()),
            Value::Array(arr) => {
                let selected = arr
                    .iter()
                    .filter_map(|v| v.as_str())
                    .find(|s| *s != "null")
                    .unwrap_or("string")
                    .to_lowercase();
                *type_val = Value::String(selected);
            }
            _ => {}
        }
    }

    // Recurse into child schemas before pruning keys
    if let Some(Value::Object(props)) = map.get_mut("properties") {
        for (_, prop_schema) in props.iter_mut() {
            sanitize_schema_node(prop_schema);
        }
    }
    if let Some(items) = map.get_mut("items") {
        match items {
            Value::Array(arr) => {
                // Tuple form is not supported; keep the first item schema
                let first = arr.first().cloned().unwrap_or_else(|| Value::Object(Default::default()));
                *items = first;
                sanitize_schema_node(items);
            }
            _ => sanitize_schema_node(items),
        }
    }

    // required entries must exist in properties, or the upstream throws
    // INVALID_ARGUMENT
    let prop_names: Option<std::collections::HashSet<String>> = map
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|obj| obj.keys().cloned().collect());

    if let Some(Value::Array(required)) = map.get_mut("required") {
        match &prop_names {
            Some(names) => required.retain(|k| k.as_str().map(|s| names.contains(s)).unwrap_or(false)),
            None => required.clear(),
        }
    }

    map.retain(|k, _| ALLOWED_KEYS.contains(&k.as_str()));
}

static TOOL_NAME_INVALID: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

/// Normalize a tool name into `[A-Za-z0-9_-]{1,64}`.
pub fn normalize_tool_name(name: &str) -> String {
    let mut normalized = TOOL_NAME_INVALID.replace_all(name, "_").to_string();

    if normalized.len() > 64 {
        normalized.truncate(64);
    }
    if normalized.is_empty() {
        normalized = "tool".to_string();
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strips_unsupported_keywords() {
        let mut schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "location": {
                    "type": "string",
                    "description": "City name",
                    "minLength": 1,
                    "format": "city"
                },
                "unit": {
                    "type": ["string", "null"],
                    "enum": ["celsius", "fahrenheit"],
                    "default": "celsius"
                }
            },
            "required": ["location"]
        });

        sanitize_tool_schema(&mut schema);

        assert!(schema.get("$schema").is_none());
        assert!(schema.get("additionalProperties").is_none());
        assert!(schema["properties"]["location"].get("minLength").is_none());
        assert!(schema["properties"]["location"].get("format").is_none());
        assert!(schema["properties"]["unit"].get("default").is_none());
        assert_eq!(schema["properties"]["unit"]["type"], "string");
        assert_eq!(schema["properties"]["unit"]["enum"][0], "celsius");
        assert_eq!(schema["properties"]["location"]["description"], "City name");
        assert_eq!(schema["required"][0], "location");
    }

    #[test]
    fn test_idempotent() {
        let mut schema = json!({
            "type": "OBJECT",
            "properties": {
                "q": { "type": ["string", "null"], "pattern": "^a" }
            },
            "required": ["q", "missing"],
            "oneOf": [{ "description": "first" }, { "description": "second" }]
        });

        sanitize_tool_schema(&mut schema);
        let once = schema.clone();
        sanitize_tool_schema(&mut schema);

        assert_eq!(schema, once);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["description"], "first");
        assert_eq!(schema["required"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_inlines_refs() {
        let mut schema = json!({
            "$defs": {
                "Address": {
                    "type": "object",
                    "properties": { "city": { "type": "string" } }
                }
            },
            "type": "object",
            "properties": {
                "home": { "$ref": "#/$defs/Address" }
            }
        });

        sanitize_tool_schema(&mut schema);

        assert_eq!(schema["properties"]["home"]["type"], "object");
        assert_eq!(schema["properties"]["home"]["properties"]["city"]["type"], "string");
        assert!(schema.get("$defs").is_none());
    }

    #[test]
    fn test_property_named_like_keyword_survives() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "enum": { "type": "string" },
                "items": { "type": "integer" }
            }
        });

        sanitize_tool_schema(&mut schema);

        assert_eq!(schema["properties"]["enum"]["type"], "string");
        assert_eq!(schema["properties"]["items"]["type"], "integer");
    }

    #[test]
    fn test_tuple_items_collapse() {
        let mut schema = json!({
            "type": "array",
            "items": [{ "type": "STRING", "format": "uri" }, { "type": "integer" }]
        });

        sanitize_tool_schema(&mut schema);

        assert_eq!(schema["items"]["type"], "string");
        assert!(schema["items"].get("format").is_none());
    }

    #[test]
    fn test_normalize_tool_name() {
        assert_eq!(normalize_tool_name("get_weather"), "get_weather");
        assert_eq!(normalize_tool_name("mcp.server/tool"), "mcp_server_tool");
        assert_eq!(normalize_tool_name(""), "tool");

        let long = "a".repeat(80);
        assert_eq!(normalize_tool_name(&long).len(), 64);
    }
}
