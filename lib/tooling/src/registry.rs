//! The tool registry.
//!
//! A name-keyed catalog of tools, built once at startup and read-only
//! afterwards, so concurrent runs can look up tools without coordination.

use crate::error::ToolError;
use crate::tool::{ApprovalLevel, Tool};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Summary of a registered tool (for catalogs and model prompts).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ToolDescriptor {
    /// Unique name of the tool.
    pub name: String,
    /// Description of what the tool does.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: JsonValue,
    /// The tool's intrinsic approval level.
    pub approval_level: ApprovalLevel,
}

/// An immutable catalog of tools keyed by name.
///
/// Constructed through [`ToolRegistryBuilder`]; once built it cannot be
/// modified, which makes it safe to share across concurrently executing
/// runs behind an `Arc`.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Returns the tool with the given name, if registered.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Returns the approval level of the named tool, if registered.
    #[must_use]
    pub fn approval_level(&self, name: &str) -> Option<ApprovalLevel> {
        self.tools.get(name).map(|t| t.approval_level())
    }

    /// Returns true if a tool with the given name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns true if no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Returns descriptors for all registered tools, sorted by name.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<_> = self
            .tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
                approval_level: tool.approval_level(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Invokes the named tool with the given arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotFound`] for unregistered names, or whatever
    /// the tool itself raises.
    pub async fn invoke(&self, name: &str, args: JsonValue) -> Result<JsonValue, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        tool.invoke(args).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

/// Builder for [`ToolRegistry`].
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    /// Registers a tool under its own name.
    ///
    /// Registering a second tool with the same name replaces the first;
    /// startup code logs a warning when that happens.
    #[must_use]
    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "replacing previously registered tool");
        }
        self
    }

    /// Finalizes the registry.
    #[must_use]
    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}
