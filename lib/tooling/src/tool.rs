//! The tool capability interface.
//!
//! A tool is an opaque async operation against a cloud provider: it has a
//! name, a description, a JSON Schema for its arguments, an intrinsic
//! approval level, and an invoke function. The engine never inspects a
//! tool's implementation.

use crate::error::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The intrinsic risk category a tool declares for itself.
///
/// This is the tool author's judgment of how dangerous the operation is;
/// the derived [`RiskLevel`](crate::risk::RiskLevel) and the configured
/// threshold decide whether a human has to approve a given call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalLevel {
    /// Read-only or otherwise harmless; may always run unattended.
    Auto,
    /// Mutating but reversible; a human should normally confirm.
    Confirm,
    /// Destructive or irreversible (terminate, delete, revoke).
    Danger,
}

/// Capability interface for a cloud-provider tool.
///
/// Implementations wrap provider SDK/CLI calls and live outside this
/// workspace. Registered tools must be safe to invoke concurrently from
/// many runs.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name of the tool within the catalog.
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> JsonValue {
        serde_json::json!({ "type": "object" })
    }

    /// The tool's intrinsic approval level.
    fn approval_level(&self) -> ApprovalLevel;

    /// Invokes the tool with the given arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments are invalid or the underlying
    /// provider call fails.
    async fn invoke(&self, args: JsonValue) -> Result<JsonValue, ToolError>;
}

/// A tool that returns a canned result (for tests and wiring checks).
pub struct StaticTool {
    name: String,
    approval_level: ApprovalLevel,
    result: JsonValue,
}

impl StaticTool {
    /// Creates a static tool with the given name, level, and result.
    #[must_use]
    pub fn new(name: impl Into<String>, approval_level: ApprovalLevel, result: JsonValue) -> Self {
        Self {
            name: name.into(),
            approval_level,
            result,
        }
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "returns a canned result"
    }

    fn approval_level(&self) -> ApprovalLevel {
        self.approval_level
    }

    async fn invoke(&self, _args: JsonValue) -> Result<JsonValue, ToolError> {
        Ok(self.result.clone())
    }
}

/// A tool that echoes its arguments back (for tests).
pub struct EchoTool {
    name: String,
    approval_level: ApprovalLevel,
}

impl EchoTool {
    /// Creates an echo tool with the given name and level.
    #[must_use]
    pub fn new(name: impl Into<String>, approval_level: ApprovalLevel) -> Self {
        Self {
            name: name.into(),
            approval_level,
        }
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "echoes its arguments"
    }

    fn approval_level(&self) -> ApprovalLevel {
        self.approval_level
    }

    async fn invoke(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        Ok(args)
    }
}

/// A tool that always fails (for tests).
pub struct FailingTool {
    name: String,
    approval_level: ApprovalLevel,
    reason: String,
}

impl FailingTool {
    /// Creates a failing tool with the given name, level, and failure reason.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        approval_level: ApprovalLevel,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            approval_level,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn approval_level(&self) -> ApprovalLevel {
        self.approval_level
    }

    async fn invoke(&self, _args: JsonValue) -> Result<JsonValue, ToolError> {
        Err(ToolError::InvocationFailed {
            name: self.name.clone(),
            reason: self.reason.clone(),
        })
    }
}
