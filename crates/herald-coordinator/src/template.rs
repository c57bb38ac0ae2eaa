//! `{{step.field}}` placeholder resolution against shared state.

use std::sync::LazyLock;

use herald_core::types::Parameters;
use regex::Regex;
use serde_json::Value;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([\w-]+)((?:\.[\w-]+)*)\s*\}\}").expect("Invalid placeholder regex")
});

/// Look up `step` then each dotted field in `state`.
fn lookup<'a>(state: &'a serde_json::Map<String, Value>, step: &str, path: &str) -> Option<&'a Value> {
    let mut current = state.get(step)?;
    for field in path.split('.').filter(|f| !f.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(field)?,
            Value::Array(items) => items.get(field.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_value(
    value: &Value,
    state: &serde_json::Map<String, Value>,
) -> Result<Value, String> {
    match value {
        Value::String(text) => {
            // A lone placeholder keeps the referenced value's type.
            if let Some(caps) = PLACEHOLDER.captures(text) {
                if caps.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
                    return lookup(state, &caps[1], &caps[2])
                        .cloned()
                        .ok_or_else(|| format!("unresolved placeholder {}", text));
                }
            }
            let mut missing = None;
            let rendered = PLACEHOLDER.replace_all(text, |caps: &regex::Captures<'_>| {
                match lookup(state, &caps[1], &caps[2]) {
                    Some(v) => render(v),
                    None => {
                        missing.get_or_insert_with(|| caps[0].to_string());
                        String::new()
                    }
                }
            });
            match missing {
                Some(placeholder) => Err(format!("unresolved placeholder {}", placeholder)),
                None => Ok(Value::String(rendered.into_owned())),
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, state))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_params(map, state).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve every placeholder in `params`. Unknown references are an error.
pub fn resolve_params(
    params: &Parameters,
    state: &serde_json::Map<String, Value>,
) -> Result<Parameters, String> {
    params
        .iter()
        .map(|(k, v)| -> Result<(String, Value), String> {
            Ok((k.clone(), resolve_value(v, state)?))
        })
        .collect()
}
