//! Predicates over the variable environment.
//!
//! Used by condition branches and loop termination. Evaluation never
//! fails: a missing variable makes a comparison false.

use nimbus_ai::prompt::lookup_path;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A typed predicate over the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// The value at `path` exists and is truthy (not null, false, 0, or "").
    Truthy { path: String },
    /// The value at `path` exists.
    Exists { path: String },
    /// The value at `path` equals `value`.
    Equals { path: String, value: JsonValue },
    /// The value at `path` exists and differs from `value`.
    NotEquals { path: String, value: JsonValue },
    /// The value at `path` is a number greater than `value`.
    GreaterThan { path: String, value: f64 },
    /// The value at `path` is a number less than `value`.
    LessThan { path: String, value: f64 },
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

impl Predicate {
    /// Evaluates the predicate against the environment.
    #[must_use]
    pub fn evaluate(&self, environment: &JsonValue) -> bool {
        match self {
            Self::Truthy { path } => lookup_path(environment, path).is_some_and(is_truthy),
            Self::Exists { path } => lookup_path(environment, path).is_some(),
            Self::Equals { path, value } => {
                lookup_path(environment, path).is_some_and(|v| v == value)
            }
            Self::NotEquals { path, value } => {
                lookup_path(environment, path).is_some_and(|v| v != value)
            }
            Self::GreaterThan { path, value } => lookup_path(environment, path)
                .and_then(JsonValue::as_f64)
                .is_some_and(|v| v > *value),
            Self::LessThan { path, value } => lookup_path(environment, path)
                .and_then(JsonValue::as_f64)
                .is_some_and(|v| v < *value),
        }
    }
}
