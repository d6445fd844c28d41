//! JSON Schema sanitation for upstream function declarations.
//!
//! The upstream API accepts a narrow schema dialect: a handful of keywords
//! and uppercase type names. Client tools arrive with the full JSON Schema
//! vocabulary, so declarations go through two phases:
//!
//!   1. [`clean_schema`] folds unsupported constructs (`$ref`, `allOf`,
//!      `anyOf`/`oneOf`, nullable type arrays, string/array constraints,
//!      small enums) into description hints, strips the rest, and rewrites
//!      type names to the uppercase dialect.
//!   2. [`sanitize_schema`] keeps only the supported keywords, converts
//!      `const` to `enum`, defaults missing types, and substitutes a
//!      placeholder when an object would emit no properties.
//!
//! [`tool_parameters`] composes both for the request builder.

use serde_json::{json, Map, Value};

/// Keywords the upstream dialect understands.
const ALLOWED_KEYS: &[&str] = &[
    "type",
    "description",
    "properties",
    "required",
    "items",
    "enum",
    "title",
];

/// Keywords removed outright during cleaning (after folding).
const STRIP_KEYS: &[&str] = &[
    "additionalProperties",
    "default",
    "$schema",
    "$defs",
    "definitions",
    "$ref",
    "$id",
    "$comment",
    "title",
    "minLength",
    "maxLength",
    "pattern",
    "format",
    "minItems",
    "maxItems",
    "examples",
    "allOf",
    "anyOf",
    "oneOf",
];

/// Enums with this many entries or fewer are folded into the description.
const ENUM_FOLD_MAX: usize = 10;

/// Full schema treatment for a tool's input schema.
///
/// Returns the upstream-ready parameters object; empty or property-less
/// schemas become the placeholder schema.
pub fn tool_parameters(schema: &Value) -> Value {
    let cleaned = clean_schema(schema);
    let sanitized = sanitize_schema(&cleaned);

    let has_properties = sanitized
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|p| !p.is_empty());
    if has_properties {
        sanitized
    } else {
        placeholder_schema()
    }
}

/// Map a tool name into the upstream charset: `[A-Za-z0-9_-]`, at most 64
/// characters, disallowed characters replaced with `_`.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

/// Placeholder emitted when a tool declares no usable parameters; the
/// upstream API rejects empty property maps.
fn placeholder_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "reason": {
                "type": "STRING",
                "description": "Reason for invoking this tool"
            }
        },
        "required": ["reason"]
    })
}

// ---------------------------------------------------------------------------
// Phase 2: allowlist sanitizer
// ---------------------------------------------------------------------------

/// Keep only supported keywords, convert `const` to `enum`, and default the
/// type of untyped nodes to `object`.
pub fn sanitize_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return json!({"type": "object"});
    };

    let mut out = Map::new();

    if let Some(constant) = obj.get("const") {
        out.insert("enum".to_string(), json!([constant]));
    }

    for (key, value) in obj {
        if !ALLOWED_KEYS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "properties" => {
                let mut props = Map::new();
                if let Some(map) = value.as_object() {
                    for (name, sub) in map {
                        props.insert(name.clone(), sanitize_schema(sub));
                    }
                }
                out.insert("properties".to_string(), Value::Object(props));
            }
            "items" => {
                out.insert("items".to_string(), sanitize_schema(value));
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    if !out.contains_key("type") {
        out.insert("type".to_string(), json!("object"));
    }

    Value::Object(out)
}

// ---------------------------------------------------------------------------
// Phase 1: Gemini-dialect cleaner
// ---------------------------------------------------------------------------

/// Clean a schema for upstream emission. See the module docs for the list
/// of transformations.
pub fn clean_schema(schema: &Value) -> Value {
    clean_node(schema).0
}

/// Cleans one node; the boolean reports whether the node was nullable so
/// the parent can drop it from `required`.
fn clean_node(schema: &Value) -> (Value, bool) {
    let Some(obj) = schema.as_object() else {
        return (json!({"type": "STRING"}), false);
    };
    let mut node = obj.clone();
    let mut hints: Vec<String> = Vec::new();
    let mut nullable = false;

    // (i) $ref becomes a description hint.
    if let Some(reference) = node.remove("$ref").and_then(|v| v.as_str().map(String::from)) {
        hints.push(format!("See definition: {reference}"));
    }

    // (v) Merge allOf: later entries override earlier properties, required
    // is unioned, and scalar keys already on the parent win.
    if let Some(Value::Array(entries)) = node.remove("allOf") {
        merge_all_of(&mut node, &entries);
    }

    // (vi) Flatten anyOf/oneOf to the highest-scoring option.
    for keyword in ["anyOf", "oneOf"] {
        if let Some(Value::Array(options)) = node.remove(keyword) {
            if let Some(hint) = flatten_one_of(&mut node, &options) {
                hints.push(hint);
            }
        }
    }

    // const behaves as a single-entry enum.
    if let Some(constant) = node.remove("const") {
        node.insert("enum".to_string(), json!([constant]));
    }

    // (vii) `type: [T, null]` arrays flatten to T and mark nullability.
    if let Some(Value::Array(types)) = node.get("type").cloned() {
        let non_null: Vec<String> = types
            .iter()
            .filter_map(|t| t.as_str())
            .filter(|t| *t != "null")
            .map(String::from)
            .collect();
        nullable = non_null.len() < types.len();
        let picked = non_null.first().cloned().unwrap_or_else(|| "string".into());
        node.insert("type".to_string(), json!(picked));
    }

    // (ii) Fold small enums into the description.
    if let Some(Value::Array(values)) = node.get("enum").cloned() {
        if (2..=ENUM_FOLD_MAX).contains(&values.len()) {
            let rendered: Vec<String> = values.iter().map(render_scalar).collect();
            hints.push(format!("Allowed: {}", rendered.join(", ")));
            node.remove("enum");
        }
    }

    // (iii) additionalProperties:false becomes a hint.
    if node.get("additionalProperties") == Some(&json!(false)) {
        hints.push("No additional properties allowed".to_string());
    }

    // (iv) Size/format/pattern constraints become hints.
    for key in ["minLength", "maxLength", "pattern", "format", "minItems", "maxItems"] {
        if let Some(value) = node.get(key) {
            hints.push(format!("{key}: {}", render_scalar(value)));
        }
    }

    // (viii) Strip the remaining unsupported keywords.
    for key in STRIP_KEYS {
        node.remove(*key);
    }

    // Recurse into properties; nullable children leave `required`.
    let mut nullable_children: Vec<String> = Vec::new();
    if let Some(Value::Object(props)) = node.get("properties").cloned() {
        let mut cleaned_props = Map::new();
        for (name, sub) in props {
            let (cleaned, child_nullable) = clean_node(&sub);
            if child_nullable {
                nullable_children.push(name.clone());
            }
            cleaned_props.insert(name, cleaned);
        }
        node.insert("properties".to_string(), Value::Object(cleaned_props));
    }

    if let Some(items) = node.get("items").cloned() {
        node.insert("items".to_string(), clean_node(&items).0);
    }

    // (ix) Required entries must name defined, non-nullable properties.
    if let Some(Value::Array(required)) = node.get("required").cloned() {
        let defined: Vec<String> = node
            .get("properties")
            .and_then(Value::as_object)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        let kept: Vec<Value> = required
            .into_iter()
            .filter(|r| {
                r.as_str().is_some_and(|name| {
                    defined.iter().any(|d| d == name)
                        && !nullable_children.iter().any(|n| n == name)
                })
            })
            .collect();
        if kept.is_empty() {
            node.remove("required");
        } else {
            node.insert("required".to_string(), Value::Array(kept));
        }
    }

    // (x) Uppercase type names; untyped nodes are inferred.
    let type_name = node
        .get("type")
        .and_then(Value::as_str)
        .map(upstream_type)
        .unwrap_or_else(|| {
            if node.contains_key("properties") {
                "OBJECT"
            } else if node.contains_key("items") {
                "ARRAY"
            } else {
                "STRING"
            }
        });
    node.insert("type".to_string(), json!(type_name));

    // Fold accumulated hints into the description.
    if !hints.is_empty() || nullable {
        let mut description = node
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        for hint in hints {
            if !description.is_empty() {
                description.push(' ');
            }
            description.push_str(&hint);
        }
        if nullable {
            if description.is_empty() {
                description.push_str("(nullable)");
            } else {
                description.push_str(" (nullable)");
            }
        }
        node.insert("description".to_string(), json!(description));
    }

    (Value::Object(node), nullable)
}

fn merge_all_of(node: &mut Map<String, Value>, entries: &[Value]) {
    let mut merged_props = Map::new();
    let mut merged_required: Vec<Value> = Vec::new();

    for entry in entries {
        let Some(entry) = entry.as_object() else { continue };
        if let Some(Value::Object(props)) = entry.get("properties") {
            for (name, sub) in props {
                merged_props.insert(name.clone(), sub.clone());
            }
        }
        if let Some(Value::Array(required)) = entry.get("required") {
            for item in required {
                if !merged_required.contains(item) {
                    merged_required.push(item.clone());
                }
            }
        }
        for (key, value) in entry {
            if key == "properties" || key == "required" {
                continue;
            }
            // Parent keys win on scalar conflicts.
            node.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    if !merged_props.is_empty() {
        let props = node
            .entry("properties".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(props) = props.as_object_mut() {
            for (name, sub) in merged_props {
                props.entry(name).or_insert(sub);
            }
        }
    }
    if !merged_required.is_empty() {
        let required = node
            .entry("required".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(required) = required.as_array_mut() {
            for item in merged_required {
                if !required.contains(&item) {
                    required.push(item);
                }
            }
        }
    }
}

/// Score 3: object with properties, 2: array with items, 1: non-null
/// scalar, 0: null or unknown. The winning option is merged into the node;
/// the returned hint lists every option.
fn flatten_one_of(node: &mut Map<String, Value>, options: &[Value]) -> Option<String> {
    if options.is_empty() {
        return None;
    }

    let mut best: Option<(&Value, u8)> = None;
    let mut summaries: Vec<String> = Vec::new();

    for option in options {
        let score = option_score(option);
        summaries.push(option_summary(option));
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((option, score));
        }
    }

    if let Some((winner, _)) = best {
        if let Some(winner) = winner.as_object() {
            for (key, value) in winner {
                node.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    Some(format!("Accepts: {}", summaries.join(" | ")))
}

fn option_score(option: &Value) -> u8 {
    let Some(obj) = option.as_object() else { return 0 };
    let type_name = obj.get("type").and_then(Value::as_str);
    match type_name {
        Some("object") => {
            if obj.get("properties").and_then(Value::as_object).is_some_and(|p| !p.is_empty()) {
                3
            } else {
                1
            }
        }
        Some("array") => {
            if obj.contains_key("items") {
                2
            } else {
                1
            }
        }
        Some("null") | None => {
            if obj.contains_key("properties") {
                3
            } else {
                0
            }
        }
        Some(_) => 1,
    }
}

fn option_summary(option: &Value) -> String {
    let Some(obj) = option.as_object() else {
        return "unknown".to_string();
    };
    obj.get("type")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| {
            if obj.contains_key("properties") {
                "object".to_string()
            } else {
                "unknown".to_string()
            }
        })
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Translate a JSON Schema type to the upstream uppercase name.
fn upstream_type(name: &str) -> &'static str {
    match name {
        "string" => "STRING",
        "number" => "NUMBER",
        "integer" => "INTEGER",
        "boolean" => "BOOLEAN",
        "array" => "ARRAY",
        "object" => "OBJECT",
        // null has no upstream counterpart.
        "null" => "STRING",
        _ => "STRING",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nullable_enum_folding() {
        let input = json!({
            "type": "object",
            "properties": {
                "color": {"type": ["string", "null"], "enum": ["a", "b"]}
            },
            "required": ["color"]
        });

        let cleaned = clean_schema(&input);
        let color = &cleaned["properties"]["color"];
        assert_eq!(color["type"], "STRING");
        assert_eq!(color["description"], "Allowed: a, b (nullable)");
        assert!(color.get("enum").is_none());
        // Nullable property leaves the parent's required list.
        assert!(cleaned.get("required").is_none());
    }

    #[test]
    fn test_const_to_enum() {
        let sanitized = sanitize_schema(&json!({"type": "string", "const": "fixed"}));
        assert_eq!(sanitized["enum"], json!(["fixed"]));
    }

    #[test]
    fn test_sanitize_defaults_type() {
        let sanitized = sanitize_schema(&json!({"description": "untyped"}));
        assert_eq!(sanitized["type"], "object");
    }

    #[test]
    fn test_sanitize_drops_unknown_keys() {
        let sanitized = sanitize_schema(&json!({
            "type": "string",
            "minLength": 3,
            "x-vendor": true
        }));
        assert!(sanitized.get("minLength").is_none());
        assert!(sanitized.get("x-vendor").is_none());
    }

    #[test]
    fn test_ref_becomes_hint() {
        let cleaned = clean_schema(&json!({"$ref": "#/$defs/Location"}));
        assert!(cleaned["description"]
            .as_str()
            .unwrap()
            .contains("#/$defs/Location"));
        assert!(cleaned.get("$ref").is_none());
    }

    #[test]
    fn test_constraints_folded_into_description() {
        let cleaned = clean_schema(&json!({
            "type": "string",
            "description": "A name.",
            "minLength": 1,
            "maxLength": 64,
            "pattern": "^[a-z]+$"
        }));
        let description = cleaned["description"].as_str().unwrap();
        assert!(description.starts_with("A name."));
        assert!(description.contains("minLength: 1"));
        assert!(description.contains("maxLength: 64"));
        assert!(description.contains("pattern: ^[a-z]+$"));
        assert!(cleaned.get("pattern").is_none());
    }

    #[test]
    fn test_all_of_merge() {
        let cleaned = clean_schema(&json!({
            "type": "object",
            "allOf": [
                {"properties": {"a": {"type": "string"}}, "required": ["a"]},
                {"properties": {"b": {"type": "integer"}}, "required": ["b"]}
            ]
        }));
        assert_eq!(cleaned["properties"]["a"]["type"], "STRING");
        assert_eq!(cleaned["properties"]["b"]["type"], "INTEGER");
        let required = cleaned["required"].as_array().unwrap();
        assert!(required.contains(&json!("a")));
        assert!(required.contains(&json!("b")));
    }

    #[test]
    fn test_any_of_picks_object() {
        let cleaned = clean_schema(&json!({
            "anyOf": [
                {"type": "null"},
                {"type": "string"},
                {"type": "object", "properties": {"q": {"type": "string"}}}
            ]
        }));
        assert_eq!(cleaned["type"], "OBJECT");
        assert_eq!(cleaned["properties"]["q"]["type"], "STRING");
        assert!(cleaned["description"]
            .as_str()
            .unwrap()
            .contains("Accepts: null | string | object"));
    }

    #[test]
    fn test_required_pruned_to_defined_properties() {
        let cleaned = clean_schema(&json!({
            "type": "object",
            "properties": {"kept": {"type": "string"}},
            "required": ["kept", "ghost"]
        }));
        assert_eq!(cleaned["required"], json!(["kept"]));
    }

    #[test]
    fn test_large_enum_stays() {
        let values: Vec<String> = (0..15).map(|i| format!("v{i}")).collect();
        let cleaned = clean_schema(&json!({"type": "string", "enum": values}));
        assert!(cleaned.get("enum").is_some());
    }

    #[test]
    fn test_tool_parameters_placeholder() {
        let params = tool_parameters(&json!({}));
        assert_eq!(params["type"], "OBJECT");
        assert_eq!(params["properties"]["reason"]["type"], "STRING");
        assert_eq!(params["required"], json!(["reason"]));

        let empty_props = tool_parameters(&json!({"type": "object", "properties": {}}));
        assert_eq!(empty_props["required"], json!(["reason"]));
    }

    #[test]
    fn test_sanitize_tool_name() {
        assert_eq!(sanitize_tool_name("get weather!"), "get_weather_");
        assert_eq!(sanitize_tool_name("ok-name_2"), "ok-name_2");
        let long = "x".repeat(100);
        assert_eq!(sanitize_tool_name(&long).len(), 64);
    }

    #[test]
    fn test_additional_properties_hint() {
        let cleaned = clean_schema(&json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false
        }));
        assert!(cleaned["description"]
            .as_str()
            .unwrap()
            .contains("No additional properties"));
        assert!(cleaned.get("additionalProperties").is_none());
    }
}
