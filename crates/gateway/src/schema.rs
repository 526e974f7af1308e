//! Reshapes caller-supplied JSON-Schema fragments into the restricted dialect
//! the upstream API accepts for function parameters.
//!
//! The transformation is total: unrecognized structures are copied through and
//! nothing here ever fails.

use std::collections::HashSet;

use serde_json::{Map, Value};

/// Keys the upstream dialect has no use for.
const DROPPED_KEYS: &[&str] = &["$defs", "definitions", "$schema", "$id", "const", "oneOf", "strict"];

/// Sanitize a parameters schema.
pub fn sanitize(schema: &Value) -> Value {
    let mut visited = HashSet::new();
    sanitize_value(schema, &mut visited)
}

fn sanitize_value(value: &Value, visited: &mut HashSet<usize>) -> Value {
    let Value::Object(schema) = value else {
        return value.clone();
    };

    // Cycle guard keyed on node identity, not structural equality.
    let node = value as *const Value as usize;
    if !visited.insert(node) {
        return Value::Object(Map::new());
    }

    let mut out = Map::new();
    let mut default_value = None;

    for (key, entry) in schema {
        match key.as_str() {
            "type" => {
                out.insert("type".to_string(), Value::String(map_type(entry)));
            }
            "properties" => match entry {
                Value::Object(entries) => {
                    let sanitized: Map<String, Value> = entries
                        .iter()
                        .map(|(name, prop)| {
                            let prop = if prop.is_object() {
                                sanitize_value(prop, visited)
                            } else {
                                prop.clone()
                            };
                            (name.clone(), prop)
                        })
                        .collect();
                    merge_properties(&mut out, sanitized);
                }
                other => {
                    out.insert(key.clone(), other.clone());
                }
            },
            "items" => {
                let items = if entry.is_object() {
                    sanitize_value(entry, visited)
                } else {
                    entry.clone()
                };
                out.insert(key.clone(), items);
            }
            "required" => merge_required(&mut out, entry.clone()),
            "allOf" => {
                if let Value::Array(elements) = entry {
                    merge_all_of(elements, &mut out, visited);
                }
            }
            "anyOf" => {
                if let Value::Array(elements) = entry
                    && !elements.is_empty()
                    && let Some(consts) = elements
                        .iter()
                        .map(|element| element.get("const").cloned())
                        .collect::<Option<Vec<_>>>()
                {
                    out.insert("enum".to_string(), Value::Array(consts));
                }
            }
            "default" => default_value = Some(entry),
            key if DROPPED_KEYS.contains(&key) => {}
            _ => {
                out.insert(key.clone(), entry.clone());
            }
        }
    }

    if let Some(default) = default_value {
        let suffix = format!("(Default: {})", render_default(default));
        let description = match out.get("description").and_then(Value::as_str) {
            Some(existing) => format!("{existing} {suffix}"),
            None => suffix,
        };
        out.insert("description".to_string(), Value::String(description));
    }

    Value::Object(out)
}

/// Merge the elements of an `allOf` array into the parent schema: union of
/// `properties`, concatenation of `required`, last-writer-wins otherwise.
fn merge_all_of(elements: &[Value], out: &mut Map<String, Value>, visited: &mut HashSet<usize>) {
    for element in elements {
        let Value::Object(sanitized) = sanitize_value(element, visited) else {
            continue;
        };

        for (key, entry) in sanitized {
            match key.as_str() {
                "properties" => {
                    if let Value::Object(entries) = entry {
                        merge_properties(out, entries);
                    }
                }
                "required" => merge_required(out, entry),
                _ => {
                    out.insert(key, entry);
                }
            }
        }
    }
}

fn merge_properties(out: &mut Map<String, Value>, entries: Map<String, Value>) {
    let target = out
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));

    if let Value::Object(target) = target {
        target.extend(entries);
    }
}

fn merge_required(out: &mut Map<String, Value>, entry: Value) {
    let Value::Array(names) = entry else {
        out.insert("required".to_string(), entry);
        return;
    };

    let target = out
        .entry("required")
        .or_insert_with(|| Value::Array(Vec::new()));

    if let Value::Array(target) = target {
        target.extend(names);
    }
}

/// Map a `type` entry to the uppercase singleton set the upstream accepts.
/// Type arrays collapse to their first non-"null" member.
fn map_type(entry: &Value) -> String {
    match entry {
        Value::String(name) => upstream_type(name),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .find(|name| *name != "null")
            .map(upstream_type)
            .unwrap_or_else(|| "STRING".to_string()),
        _ => "STRING".to_string(),
    }
}

fn upstream_type(name: &str) -> String {
    let name = match name.to_ascii_lowercase().as_str() {
        "string" => "STRING",
        "number" => "NUMBER",
        "integer" => "INTEGER",
        "boolean" => "BOOLEAN",
        "array" => "ARRAY",
        "object" => "OBJECT",
        _ => "STRING",
    };

    name.to_string()
}

fn render_default(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
