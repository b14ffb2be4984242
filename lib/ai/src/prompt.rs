//! Prompt template rendering.
//!
//! Templates use `{{path}}` placeholders, where `path` is a dotted path
//! into a JSON context (for example `{{incident.summary}}`). Rendering is
//! strict: a placeholder that resolves to nothing is an error, not silent
//! empty text, so a half-rendered prompt never reaches a model.

use crate::error::PromptError;
use serde_json::Value as JsonValue;

/// Looks up a dotted path in a JSON value.
///
/// Path segments index into objects by key; an empty path returns the
/// value itself.
#[must_use]
pub fn lookup_path<'a>(context: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(context);
    }
    let mut current = context;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn render_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders a template against a JSON context.
///
/// # Errors
///
/// Returns [`PromptError::MissingVariable`] if a placeholder path does not
/// resolve, or [`PromptError::UnterminatedPlaceholder`] on a `{{` without
/// a matching `}}`.
pub fn render(template: &str, context: &JsonValue) -> Result<String, PromptError> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            return Err(PromptError::UnterminatedPlaceholder {
                position: template.len() - rest.len() + start,
            });
        };
        let path = after_open[..end].trim();
        let value = lookup_path(context, path).ok_or_else(|| PromptError::MissingVariable {
            variable: path.to_string(),
        })?;
        result.push_str(&render_value(value));
        rest = &after_open[end + 2..];
    }
    result.push_str(rest);
    Ok(result)
}
