//! Argument template resolution.
//!
//! Tool arguments and output mappings are JSON values whose string leaves
//! may contain `{{variable.path}}` placeholders. A string that is exactly
//! one placeholder substitutes the raw JSON value (preserving its type);
//! a string with embedded placeholders renders display text.

use nimbus_ai::error::PromptError;
use nimbus_ai::prompt::{lookup_path, render};
use serde_json::Value as JsonValue;

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    let path = inner.trim();
    // A second opening brace means this is not a single placeholder.
    if path.contains("{{") { None } else { Some(path) }
}

/// Resolves a template against the environment.
///
/// Objects and arrays are resolved recursively; non-string leaves pass
/// through unchanged.
///
/// # Errors
///
/// Returns an error if a placeholder path does not resolve.
pub fn resolve(template: &JsonValue, environment: &JsonValue) -> Result<JsonValue, PromptError> {
    match template {
        JsonValue::String(s) => {
            if let Some(path) = whole_placeholder(s) {
                let value =
                    lookup_path(environment, path).ok_or_else(|| PromptError::MissingVariable {
                        variable: path.to_string(),
                    })?;
                Ok(value.clone())
            } else {
                Ok(JsonValue::String(render(s, environment)?))
            }
        }
        JsonValue::Array(items) => items
            .iter()
            .map(|item| resolve(item, environment))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        JsonValue::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve(value, environment)?);
            }
            Ok(JsonValue::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}
