//! Workflow node types.
//!
//! A node is one step in a workflow graph. The kind enum carries the
//! type-specific data; the executor dispatches on it.

use crate::predicate::Predicate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use ulid::Ulid;

/// Unique identifier for a node within a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Ulid);

impl NodeId {
    /// Creates a new node ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// One branch of a condition node.
///
/// Branches are evaluated in declared order; the first whose predicate
/// holds selects the outgoing edge with the matching label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionBranch {
    /// Label matching an outgoing edge.
    pub label: String,
    /// Predicate evaluated against the environment.
    pub predicate: Predicate,
}

impl ConditionBranch {
    /// Creates a branch.
    #[must_use]
    pub fn new(label: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            label: label.into(),
            predicate,
        }
    }
}

/// How a parallel node combines its branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// The first branch to complete wins; remaining branches are not run.
    FirstCompleted,
    /// All branches run; failures are recorded but do not fail the node.
    AllCompleted,
    /// All branches run and all must succeed; one failure fails the node.
    AllSucceeded,
}

/// The kind of a workflow node, with its type-specific data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry marker; exactly one per graph. The run input is bound into the
    /// environment under `input` before traversal starts.
    Input,
    /// Terminal marker. The mapping template, resolved against the final
    /// environment, becomes the run output.
    Output { mapping: JsonValue },
    /// Invokes a registered tool. Arguments are a template resolved against
    /// the environment; the result is bound under the node's name.
    Tool {
        tool_name: String,
        arguments: JsonValue,
    },
    /// Branches on the first matching predicate.
    Condition { branches: Vec<ConditionBranch> },
    /// Repeats a body sequence until the predicate holds, bounded by an
    /// iteration cap.
    Loop {
        body: Vec<NodeId>,
        until: Predicate,
        max_iterations: Option<u32>,
    },
    /// Fans out to branch sequences and joins per policy.
    Parallel {
        branches: Vec<Vec<NodeId>>,
        join: JoinPolicy,
    },
    /// Unconditional human approval gate.
    Approval { message: String },
    /// Renders the prompt against the environment, calls the model backend,
    /// and binds the output under `bind_to`.
    AiStep { prompt: String, bind_to: String },
}

impl NodeKind {
    /// The kind name recorded on step records.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output { .. } => "output",
            Self::Tool { .. } => "tool",
            Self::Condition { .. } => "condition",
            Self::Loop { .. } => "loop",
            Self::Parallel { .. } => "parallel",
            Self::Approval { .. } => "approval",
            Self::AiStep { .. } => "ai_step",
        }
    }

    /// Returns true for kinds that may appear inside a loop/parallel body.
    #[must_use]
    pub fn allowed_in_body(&self) -> bool {
        !matches!(
            self,
            Self::Input | Self::Output { .. } | Self::Condition { .. }
        )
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier.
    pub id: NodeId,
    /// Human-readable name; tool results are bound under this name.
    pub name: String,
    /// The node kind and its data.
    pub kind: NodeKind,
}

impl Node {
    /// Creates a node with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            kind,
        }
    }
}
