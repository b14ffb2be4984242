//! Error types for the tooling crate.

use std::fmt;

/// Errors from tool invocation.
///
/// These errors contain only information available at the tool layer.
/// Run-level context (run id, node id) is added by the workflow engine
/// when it records the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// No tool with the given name is registered.
    NotFound { name: String },
    /// The arguments did not match the tool's parameter schema.
    InvalidArguments { name: String, reason: String },
    /// The tool ran and reported a failure.
    InvocationFailed { name: String, reason: String },
    /// The underlying provider/service rejected or dropped the call.
    ProviderUnavailable { name: String, reason: String },
    /// The call exceeded its deadline.
    Timeout { name: String },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => {
                write!(f, "tool not found: {name}")
            }
            Self::InvalidArguments { name, reason } => {
                write!(f, "invalid arguments for tool '{name}': {reason}")
            }
            Self::InvocationFailed { name, reason } => {
                write!(f, "tool '{name}' failed: {reason}")
            }
            Self::ProviderUnavailable { name, reason } => {
                write!(f, "provider unavailable for tool '{name}': {reason}")
            }
            Self::Timeout { name } => {
                write!(f, "tool '{name}' timed out")
            }
        }
    }
}

impl std::error::Error for ToolError {}
