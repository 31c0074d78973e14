//! `{{key}}` template resolution against context data

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static PLACEHOLDER_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").ok());

/// Look up a key in context data
///
/// The exact flat key is tried first (`step.<id>.result` is stored flat).
/// Otherwise the longest flat prefix is found and the remaining segments walk
/// into nested objects and arrays.
pub fn lookup<'a>(data: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(value) = data.get(key) {
        return Some(value);
    }

    let parts: Vec<&str> = key.split('.').collect();
    for split in (1..parts.len()).rev() {
        let head = parts[..split].join(".");
        let Some(root) = data.get(&head) else {
            continue;
        };
        if let Some(found) = walk(root, &parts[split..]) {
            return Some(found);
        }
    }

    None
}

fn walk<'a>(mut current: &'a Value, path: &[&str]) -> Option<&'a Value> {
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// String form used when substituting a value into a template
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{key}}` whose key is present in `data`
///
/// Placeholders naming missing keys are left exactly as written.
pub fn resolve_str(template: &str, data: &Map<String, Value>) -> String {
    let Some(re) = PLACEHOLDER_REGEX.as_ref() else {
        return template.to_string();
    };

    re.replace_all(template, |caps: &Captures<'_>| {
        let key = caps[1].trim();
        match lookup(data, key) {
            Some(value) => render_value(value),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Recursively resolve templates in strings, arrays and object values
pub fn resolve_value(value: &Value, data: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_str(s, data)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, data)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, data)))
                .collect(),
        ),
        other => other.clone(),
    }
}
