//! Workflow definition types.
//!
//! A definition is a named, versioned graph. A published definition is
//! immutable; edits go through `next_version`, which yields a new draft
//! with the version bumped. Runs pin the version they were created
//! against, so later edits never affect an in-flight run.

use crate::error::GraphError;
use crate::graph::WorkflowGraph;
use chrono::{DateTime, Utc};
use nimbus_core::WorkflowId;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a definition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    /// Editable; not yet runnable by triggers.
    Draft,
    /// Immutable and runnable.
    Published,
    /// Retired; existing runs keep their pinned version.
    Archived,
}

/// A versioned workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identity, stable across versions.
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Description of what this workflow does.
    pub description: Option<String>,
    /// Monotonic version, bumped on every content change.
    pub version: u32,
    /// Lifecycle status of this version.
    pub status: DefinitionStatus,
    /// Tags for organization/filtering.
    pub tags: Vec<String>,
    /// The graph.
    pub graph: WorkflowGraph,
    /// When this version was created.
    pub created_at: DateTime<Utc>,
    /// When this version was last updated.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Creates a new draft at version 1.
    #[must_use]
    pub fn new(name: impl Into<String>, graph: WorkflowGraph) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: None,
            version: 1,
            status: DefinitionStatus::Draft,
            tags: Vec::new(),
            graph,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Validates the graph.
    ///
    /// # Errors
    ///
    /// Returns the first structural violation found.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.graph.validate()
    }

    /// Publishes this version, validating the graph first.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is structurally invalid.
    pub fn publish(&mut self) -> Result<(), GraphError> {
        self.validate()?;
        self.status = DefinitionStatus::Published;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Archives this version.
    pub fn archive(&mut self) {
        self.status = DefinitionStatus::Archived;
        self.updated_at = Utc::now();
    }

    /// Returns a new draft with the version bumped, sharing the workflow id.
    #[must_use]
    pub fn next_version(&self) -> Self {
        let now = Utc::now();
        Self {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version + 1,
            status: DefinitionStatus::Draft,
            tags: self.tags.clone(),
            graph: self.graph.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if this version is published.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.status == DefinitionStatus::Published
    }
}

/// Summary information about a definition (for listings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSummary {
    /// Workflow id.
    pub id: WorkflowId,
    /// Name.
    pub name: String,
    /// Version.
    pub version: u32,
    /// Status.
    pub status: DefinitionStatus,
    /// Tags.
    pub tags: Vec<String>,
    /// Number of nodes in the graph.
    pub node_count: usize,
    /// Last updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowDefinition> for DefinitionSummary {
    fn from(definition: &WorkflowDefinition) -> Self {
        Self {
            id: definition.id,
            name: definition.name.clone(),
            version: definition.version,
            status: definition.status,
            tags: definition.tags.clone(),
            node_count: definition.graph.node_count(),
            updated_at: definition.updated_at,
        }
    }
}
