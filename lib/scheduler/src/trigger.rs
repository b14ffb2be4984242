//! On-demand run triggers.
//!
//! The trigger is a thin driver in front of the executor: it resolves the
//! latest published definition for a workflow, creates the run record
//! with its pinned version and attribution, and hands off to execute.
//! Everything interesting (approval gating, suspension, step recording)
//! happens inside the engine.

use nimbus_core::{OrgId, UserId, WorkflowId, WorkflowRunId};
use nimbus_workflow::{
    DefinitionStore, EngineError, ExecutionResult, WorkflowExecutor, WorkflowRun,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// A request to start a workflow run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// The workflow to run.
    pub workflow_id: WorkflowId,
    /// Input bound into the run environment.
    pub input: JsonValue,
    /// The requesting user, if any.
    pub user_id: Option<UserId>,
    /// The owning org, if any.
    pub org_id: Option<OrgId>,
}

impl RunRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, input: JsonValue) -> Self {
        Self {
            workflow_id,
            input,
            user_id: None,
            org_id: None,
        }
    }

    /// Attributes the request to a user.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Attributes the request to an org.
    #[must_use]
    pub fn with_org(mut self, org_id: OrgId) -> Self {
        self.org_id = Some(org_id);
        self
    }
}

/// A started run and its first execution result.
#[derive(Debug, Clone)]
pub struct TriggeredRun {
    /// The created run's id; callers hold this to approve or cancel.
    pub run_id: WorkflowRunId,
    /// Where the first execution pass got to (completed, suspended, ...).
    pub result: ExecutionResult,
}

/// Starts analysis runs against the latest published definition.
pub struct AnalysisTrigger {
    executor: Arc<WorkflowExecutor>,
    definitions: Arc<dyn DefinitionStore>,
}

impl AnalysisTrigger {
    /// Creates a trigger.
    #[must_use]
    pub fn new(executor: Arc<WorkflowExecutor>, definitions: Arc<dyn DefinitionStore>) -> Self {
        Self {
            executor,
            definitions,
        }
    }

    /// Starts a run for the request's workflow.
    ///
    /// The run pins the latest published version at creation; definitions
    /// published afterwards do not affect it.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow has no published version or the
    /// engine cannot start the run.
    pub async fn trigger(&self, request: RunRequest) -> Result<TriggeredRun, EngineError> {
        let definition = self.definitions.latest_published(request.workflow_id).await?;

        let mut run = WorkflowRun::new(definition.id, definition.version, request.input);
        if let Some(user_id) = request.user_id {
            run = run.with_user(user_id);
        }
        if let Some(org_id) = request.org_id {
            run = run.with_org(org_id);
        }
        let run_id = run.id;

        tracing::info!(
            workflow = %definition.id,
            version = definition.version,
            run = %run_id,
            "triggering analysis run"
        );
        let result = self.executor.start(&definition, run).await?;
        Ok(TriggeredRun { run_id, result })
    }
}
