//! The approval gate: the entry point for human decisions.
//!
//! A suspended run waits here until an operator approves or rejects the
//! pending action. The gate validates the run is actually suspended,
//! decodes the stored checkpoint, loads the pinned definition version,
//! and hands the decision to the executor's resume path.

use crate::error::{ApprovalError, EngineError};
use crate::executor::{ExecutionResult, WorkflowExecutor};
use crate::repository::{DefinitionStore, RunRepository};
use crate::run::RunStatus;
use crate::state::EngineState;
use chrono::{DateTime, Utc};
use nimbus_core::{UserId, WorkflowRunId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A human decision on a pending approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// True to run the gated action, false to reject it.
    pub approved: bool,
    /// Free-form reason, mostly used on rejection.
    pub reason: Option<String>,
    /// The deciding user, if known.
    pub approver: Option<UserId>,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    /// An approval.
    #[must_use]
    pub fn approved() -> Self {
        Self {
            approved: true,
            reason: None,
            approver: None,
            decided_at: Utc::now(),
        }
    }

    /// A rejection with a reason.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            approver: None,
            decided_at: Utc::now(),
        }
    }

    /// Attributes the decision to a user.
    #[must_use]
    pub fn with_approver(mut self, approver: UserId) -> Self {
        self.approver = Some(approver);
        self
    }
}

/// Resolves pending approvals by resuming suspended runs.
pub struct ApprovalGate {
    executor: Arc<WorkflowExecutor>,
    repository: Arc<dyn RunRepository>,
    definitions: Arc<dyn DefinitionStore>,
}

impl ApprovalGate {
    /// Creates a gate.
    #[must_use]
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        repository: Arc<dyn RunRepository>,
        definitions: Arc<dyn DefinitionStore>,
    ) -> Self {
        Self {
            executor,
            repository,
            definitions,
        }
    }

    /// Applies a decision to a suspended run and drives it forward.
    ///
    /// The run's pinned definition version is loaded from the store; a
    /// checkpoint that no longer matches it (stale state) is rejected
    /// before any status transition, leaving the run suspended.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is not suspended, its checkpoint is
    /// missing or stale, or the repository fails.
    pub async fn approve_run(
        &self,
        run_id: WorkflowRunId,
        decision: ApprovalDecision,
    ) -> Result<ExecutionResult, EngineError> {
        let run = self.repository.get_run(run_id).await?;
        if run.status != RunStatus::Suspended {
            return Err(ApprovalError::RunNotSuspended {
                run_id,
                status: run.status.to_string(),
            }
            .into());
        }
        let Some(raw) = run.engine_state.clone() else {
            return Err(ApprovalError::MissingEngineState { run_id }.into());
        };
        let state = EngineState::decode(raw)?;
        let definition = self
            .definitions
            .get(run.workflow_id, run.workflow_version)
            .await?;

        tracing::info!(
            run = %run_id,
            approved = decision.approved,
            approver = decision.approver.map(|u| u.to_string()),
            "approval decision received"
        );
        self.executor.resume(&definition, &run, state, Some(decision)).await
    }
}
