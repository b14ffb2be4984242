//! Workflow engine for the nimbus platform.
//!
//! This crate provides the workflow execution engine, including:
//!
//! - **Graph Model**: Directed graphs of typed nodes with labeled edges
//! - **Node Types**: Input, Output, Tool, Condition, Loop, Parallel, Approval, AI Step
//! - **Definitions**: Named, versioned, publishable workflow definitions
//! - **Execution**: A suspendable state machine recording every node visit
//! - **Approval**: Human gates in front of risky tool calls, with durable
//!   checkpoints that survive a process restart
//! - **Recovery**: A sweeper that re-drives runs orphaned by a crash

pub mod approval;
pub mod config;
pub mod definition;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod graph;
pub mod node;
pub mod predicate;
pub mod recovery;
pub mod repository;
pub mod run;
pub mod state;
pub mod template;

pub use approval::{ApprovalDecision, ApprovalGate};
pub use config::EngineConfig;
pub use definition::{DefinitionStatus, DefinitionSummary, WorkflowDefinition};
pub use error::{
    ApprovalError, EngineError, ExecutionError, GraphError, RepositoryError, StateError,
};
pub use executor::{ExecutionResult, WorkflowExecutor};
pub use graph::{Edge, WorkflowGraph};
pub use node::{ConditionBranch, JoinPolicy, Node, NodeId, NodeKind};
pub use predicate::Predicate;
pub use recovery::{RecoverySweeper, SweepReport};
pub use repository::{
    DefinitionStore, EngineStateUpdate, InMemoryDefinitionStore, InMemoryRunRepository,
    RunRepository, RunUpdate, StepUpdate,
};
pub use run::{RunStatus, StepStatus, WorkflowRun, WorkflowStep};
pub use state::{EngineState, Frame};
