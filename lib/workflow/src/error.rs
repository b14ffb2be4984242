//! Error types for the workflow engine.
//!
//! The taxonomy separates concerns by who can act on the error:
//! - `GraphError`: structural problems in a definition, caught at
//!   validation/publish time
//! - `ExecutionError`: runtime problems that fail the run but never crash
//!   the executor
//! - `StateError`: a persisted engine state that no longer matches the
//!   definition; the run stays suspended so a corrected resume can retry
//! - `RepositoryError`: persistence unavailable; always re-raised, never
//!   downgraded to a run failure
//! - `ApprovalError`: precondition violations on the approval entry point

use crate::node::NodeId;
use nimbus_core::{WorkflowId, WorkflowRunId, WorkflowStepId};
use std::fmt;

/// Structural errors in a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The graph has no input node.
    NoEntryNode,
    /// The graph has more than one input node.
    MultipleEntryNodes { count: usize },
    /// The graph has no output node.
    NoOutputNode,
    /// An edge references a node that does not exist.
    EdgeEndpointMissing { node_id: NodeId },
    /// A loop or parallel body references a node that does not exist.
    BodyNodeMissing { node_id: NodeId, missing: NodeId },
    /// A loop or parallel body contains a node kind that cannot appear there.
    InvalidBodyNode { node_id: NodeId, member: NodeId },
    /// A loop or parallel node has an empty body.
    EmptyBody { node_id: NodeId },
    /// A condition branch has no outgoing edge with its label.
    MissingBranchEdge { node_id: NodeId, label: String },
    /// A node is not reachable from the entry node.
    Unreachable { node_id: NodeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEntryNode => write!(f, "workflow has no input node"),
            Self::MultipleEntryNodes { count } => {
                write!(f, "workflow has {count} input nodes, expected exactly one")
            }
            Self::NoOutputNode => write!(f, "workflow has no output node"),
            Self::EdgeEndpointMissing { node_id } => {
                write!(f, "edge references missing node {node_id}")
            }
            Self::BodyNodeMissing { node_id, missing } => {
                write!(f, "body of node {node_id} references missing node {missing}")
            }
            Self::InvalidBodyNode { node_id, member } => {
                write!(
                    f,
                    "body of node {node_id} contains node {member}, which cannot appear in a body"
                )
            }
            Self::EmptyBody { node_id } => {
                write!(f, "node {node_id} has an empty body")
            }
            Self::MissingBranchEdge { node_id, label } => {
                write!(f, "condition node {node_id} has no edge labeled '{label}'")
            }
            Self::Unreachable { node_id } => {
                write!(f, "node {node_id} is not reachable from the input node")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Runtime errors that fail a run.
///
/// These are recorded on the step and the run; they never escape the
/// traversal loop as a crash. Messages carry node id and tool name so a
/// run's error field is diagnosable without logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// No condition branch predicate matched.
    NoMatchingBranch { node_id: NodeId },
    /// A loop hit its iteration cap without terminating.
    LoopLimitExceeded { node_id: NodeId, limit: u32 },
    /// A tool invocation failed.
    ToolFailed {
        node_id: NodeId,
        tool_name: String,
        reason: String,
    },
    /// A model call failed.
    ModelCallFailed { node_id: NodeId, reason: String },
    /// An argument or prompt template did not resolve.
    TemplateFailed { node_id: NodeId, reason: String },
    /// The human decision rejected the gated action.
    ApprovalRejected { node_id: NodeId },
    /// Every branch of a first-completion parallel node failed.
    AllBranchesFailed { node_id: NodeId },
    /// Traversal ran off the graph without reaching an output node.
    NoOutputReached { node_id: NodeId },
}

impl ExecutionError {
    /// The node the error occurred at.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::NoMatchingBranch { node_id }
            | Self::LoopLimitExceeded { node_id, .. }
            | Self::ToolFailed { node_id, .. }
            | Self::ModelCallFailed { node_id, .. }
            | Self::TemplateFailed { node_id, .. }
            | Self::ApprovalRejected { node_id }
            | Self::AllBranchesFailed { node_id }
            | Self::NoOutputReached { node_id } => *node_id,
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingBranch { node_id } => {
                write!(f, "no condition branch matched at node {node_id}")
            }
            Self::LoopLimitExceeded { node_id, limit } => {
                write!(f, "loop limit exceeded at node {node_id} ({limit} iterations)")
            }
            Self::ToolFailed {
                node_id,
                tool_name,
                reason,
            } => {
                write!(f, "tool '{tool_name}' failed at node {node_id}: {reason}")
            }
            Self::ModelCallFailed { node_id, reason } => {
                write!(f, "model call failed at node {node_id}: {reason}")
            }
            Self::TemplateFailed { node_id, reason } => {
                write!(f, "template resolution failed at node {node_id}: {reason}")
            }
            Self::ApprovalRejected { .. } => {
                write!(f, "rejected by approver")
            }
            Self::AllBranchesFailed { node_id } => {
                write!(f, "all parallel branches failed at node {node_id}")
            }
            Self::NoOutputReached { node_id } => {
                write!(f, "traversal ended at node {node_id} without reaching an output node")
            }
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Errors from decoding or validating persisted engine state.
///
/// A `StateError` during resume leaves the run suspended and unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The state references a node the definition no longer has.
    NodeMissing { node_id: NodeId },
    /// The state was written against a different definition version.
    VersionMismatch { expected: u32, found: u32 },
    /// The serialized envelope uses an unsupported version.
    UnsupportedEnvelope { version: u32 },
    /// The state payload could not be decoded.
    DecodeFailed { reason: String },
    /// The state could not be serialized for persistence.
    EncodeFailed { reason: String },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeMissing { node_id } => {
                write!(f, "engine state references missing node {node_id}")
            }
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "engine state is for definition version {found}, expected {expected}"
                )
            }
            Self::UnsupportedEnvelope { version } => {
                write!(f, "unsupported engine state envelope version {version}")
            }
            Self::DecodeFailed { reason } => {
                write!(f, "failed to decode engine state: {reason}")
            }
            Self::EncodeFailed { reason } => {
                write!(f, "failed to encode engine state: {reason}")
            }
        }
    }
}

impl std::error::Error for StateError {}

/// Errors from the run repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// No run with the given id.
    RunNotFound { run_id: WorkflowRunId },
    /// No step with the given id.
    StepNotFound { step_id: WorkflowStepId },
    /// No definition with the given id/version.
    DefinitionNotFound { workflow_id: WorkflowId, version: u32 },
    /// The backing store is unavailable.
    Unavailable { reason: String },
    /// A conditional update lost a race.
    Conflict { reason: String },
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::StepNotFound { step_id } => write!(f, "step not found: {step_id}"),
            Self::DefinitionNotFound {
                workflow_id,
                version,
            } => {
                write!(f, "definition not found: {workflow_id} v{version}")
            }
            Self::Unavailable { reason } => write!(f, "repository unavailable: {reason}"),
            Self::Conflict { reason } => write!(f, "repository conflict: {reason}"),
        }
    }
}

impl std::error::Error for RepositoryError {}

/// Precondition violations on the approval entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    /// The run is not suspended.
    RunNotSuspended { run_id: WorkflowRunId, status: String },
    /// The run is suspended but has no persisted engine state.
    MissingEngineState { run_id: WorkflowRunId },
}

impl fmt::Display for ApprovalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotSuspended { run_id, status } => {
                write!(f, "run {run_id} is not suspended (status: {status})")
            }
            Self::MissingEngineState { run_id } => {
                write!(f, "run {run_id} is suspended but has no engine state")
            }
        }
    }
}

impl std::error::Error for ApprovalError {}

/// Umbrella error for the engine's public operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Structural definition error.
    Graph(GraphError),
    /// Stale or undecodable engine state.
    State(StateError),
    /// Persistence failure.
    Repository(RepositoryError),
    /// Approval precondition violation.
    Approval(ApprovalError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph(e) => e.fmt(f),
            Self::State(e) => e.fmt(f),
            Self::Repository(e) => e.fmt(f),
            Self::Approval(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Graph(e) => Some(e),
            Self::State(e) => Some(e),
            Self::Repository(e) => Some(e),
            Self::Approval(e) => Some(e),
        }
    }
}

impl From<GraphError> for EngineError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<RepositoryError> for EngineError {
    fn from(e: RepositoryError) -> Self {
        Self::Repository(e)
    }
}

impl From<ApprovalError> for EngineError {
    fn from(e: ApprovalError) -> Self {
        Self::Approval(e)
    }
}
