//! Run and step records.
//!
//! A run is one execution attempt of a definition version; steps are the
//! append-only record of node visits within it.

use chrono::{DateTime, Utc};
use nimbus_core::{OrgId, UserId, WorkflowId, WorkflowRunId, WorkflowStepId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::node::NodeId;

/// Lifecycle status of a run.
///
/// `pending → running → {completed | failed | suspended | cancelled}`;
/// `suspended → running` again on resume. Completed, failed, and
/// cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Suspended,
    Cancelled,
}

impl RunStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One execution attempt of a workflow definition.
///
/// The definition version is pinned at creation; later edits never affect
/// an in-flight run. `engine_state` is populated while the run is
/// suspended (and retained through the transient resume, as crash
/// insurance); terminal transitions clear it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique identifier.
    pub id: WorkflowRunId,
    /// The workflow this run executes.
    pub workflow_id: WorkflowId,
    /// Definition version pinned at creation.
    pub workflow_version: u32,
    /// Current status.
    pub status: RunStatus,
    /// The input the run was started with.
    pub input: JsonValue,
    /// Final output (if completed).
    pub output: Option<JsonValue>,
    /// Error message (if failed).
    pub error: Option<String>,
    /// Serialized engine state envelope (present iff suspended, at rest).
    pub engine_state: Option<JsonValue>,
    /// The user who started the run, if any.
    pub user_id: Option<UserId>,
    /// The org the run belongs to, if any.
    pub org_id: Option<OrgId>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// Last status transition; drives staleness queries.
    pub updated_at: DateTime<Utc>,
    /// When execution first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Creates a pending run pinned to a definition version.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, workflow_version: u32, input: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowRunId::new(),
            workflow_id,
            workflow_version,
            status: RunStatus::Pending,
            input,
            output: None,
            error: None,
            engine_state: None,
            user_id: None,
            org_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Attributes the run to a user.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Attributes the run to an org.
    #[must_use]
    pub fn with_org(mut self, org_id: OrgId) -> Self {
        self.org_id = Some(org_id);
        self
    }
}

/// Status of a step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Suspended,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// One node-visit record within a run.
///
/// Step numbers are strictly increasing per run and continue across a
/// suspend/resume boundary; they never reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique identifier.
    pub id: WorkflowStepId,
    /// The run this step belongs to.
    pub run_id: WorkflowRunId,
    /// The node visited.
    pub node_id: NodeId,
    /// The node's kind name (`tool`, `loop`, ...).
    pub node_kind: String,
    /// Position in the run's total execution order.
    pub step_number: u32,
    /// Current status.
    pub status: StepStatus,
    /// Input to the node (resolved arguments, rendered prompt, ...).
    pub input: Option<JsonValue>,
    /// Output of the node, if any.
    pub output: Option<JsonValue>,
    /// Error message (if failed or skipped).
    pub error: Option<String>,
    /// When the step was recorded.
    pub started_at: DateTime<Utc>,
    /// When the step reached a settled status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration, stamped with `completed_at`.
    pub duration_ms: Option<u64>,
}

impl WorkflowStep {
    /// Creates a step record.
    #[must_use]
    pub fn new(
        run_id: WorkflowRunId,
        node_id: NodeId,
        node_kind: impl Into<String>,
        step_number: u32,
        status: StepStatus,
        input: Option<JsonValue>,
    ) -> Self {
        Self {
            id: WorkflowStepId::new(),
            run_id,
            node_id,
            node_kind: node_kind.into(),
            step_number,
            status,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }
}
