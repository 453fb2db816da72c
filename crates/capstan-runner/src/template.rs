//! `{{dotted.path}}` template rendering over state values.

use capstan_core::{StateBag, Value};
use regex::Regex;
use std::sync::OnceLock;

/// Special token injecting the entire state, JSON-encoded.
pub const STATE_JSON_TOKEN: &str = "__state_json";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("placeholder regex"))
}

/// Substitute `{{path}}` placeholders in a string. Missing paths render
/// as the empty string; maps and sequences render as compact JSON.
pub fn render_str(template: &str, state: &StateBag) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = caps[1].trim();
            if path == STATE_JSON_TOKEN {
                return serde_json::to_string(state).unwrap_or_default();
            }
            match state.get_path(path) {
                None => String::new(),
                Some(Value::Scalar(serde_json::Value::String(s))) => s.clone(),
                Some(Value::Scalar(serde_json::Value::Null)) => String::new(),
                Some(Value::Scalar(other)) => other.to_string(),
                Some(complex) => serde_json::to_string(complex).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Recursive render over an arbitrary JSON config subtree: strings are
/// substituted, containers recurse, everything else passes through.
pub fn render_json(template: &serde_json::Value, state: &StateBag) -> serde_json::Value {
    match template {
        serde_json::Value::String(s) => serde_json::Value::String(render_str(s, state)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| render_json(v, state)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_json(v, state)))
                .collect(),
        ),
        other => other.clone(),
    }
}
