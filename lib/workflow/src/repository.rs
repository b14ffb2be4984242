//! Persistence boundary for runs, steps, and definitions.
//!
//! The engine never talks to a database directly; it drives these traits.
//! The in-memory implementations back the test suite and single-process
//! embedding; durable backends live outside this workspace.

use crate::definition::WorkflowDefinition;
use crate::error::RepositoryError;
use crate::run::{RunStatus, StepStatus, WorkflowRun, WorkflowStep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_core::{WorkflowId, WorkflowRunId, WorkflowStepId};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// What to do with the persisted engine state on a status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStateUpdate {
    /// Leave the stored value as is.
    Keep,
    /// Clear the stored value.
    Clear,
    /// Replace the stored value.
    Set(JsonValue),
}

/// A run status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    /// New status.
    pub status: RunStatus,
    /// Final output, if completing.
    pub output: Option<JsonValue>,
    /// Error message, if failing.
    pub error: Option<String>,
    /// Engine state disposition.
    pub engine_state: EngineStateUpdate,
}

impl RunUpdate {
    /// Transition to running. Engine state is retained through the
    /// transient resume so a crash mid-resume stays recoverable.
    #[must_use]
    pub fn running() -> Self {
        Self {
            status: RunStatus::Running,
            output: None,
            error: None,
            engine_state: EngineStateUpdate::Keep,
        }
    }

    /// Transition to suspended with a fresh engine state snapshot.
    #[must_use]
    pub fn suspended(engine_state: JsonValue) -> Self {
        Self {
            status: RunStatus::Suspended,
            output: None,
            error: None,
            engine_state: EngineStateUpdate::Set(engine_state),
        }
    }

    /// Transition to completed with the final output.
    #[must_use]
    pub fn completed(output: JsonValue) -> Self {
        Self {
            status: RunStatus::Completed,
            output: Some(output),
            error: None,
            engine_state: EngineStateUpdate::Clear,
        }
    }

    /// Transition to failed with an error message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            output: None,
            error: Some(error.into()),
            engine_state: EngineStateUpdate::Clear,
        }
    }

    /// Transition to cancelled.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            output: None,
            error: None,
            engine_state: EngineStateUpdate::Clear,
        }
    }
}

/// A step status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    /// New status.
    pub status: StepStatus,
    /// Output, if any.
    pub output: Option<JsonValue>,
    /// Error message, if any.
    pub error: Option<String>,
}

impl StepUpdate {
    /// Step completed with an output.
    #[must_use]
    pub fn completed(output: Option<JsonValue>) -> Self {
        Self {
            status: StepStatus::Completed,
            output,
            error: None,
        }
    }

    /// Step failed with an error.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Step skipped with a reason.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            output: None,
            error: Some(reason.into()),
        }
    }

    /// Step suspended awaiting a decision.
    #[must_use]
    pub fn suspended() -> Self {
        Self {
            status: StepStatus::Suspended,
            output: None,
            error: None,
        }
    }
}

/// Persistence interface for runs and steps.
///
/// Contract notes the executor relies on:
/// - `update_run_status` stamps `updated_at`; staleness queries read it.
/// - `claim_stale_run` is atomic: it returns the run only if it is still
///   `running` and stale, and touches `updated_at` in the same operation,
///   so two sweepers cannot both claim the same run.
/// - `claim_suspended_run` is the same compare-and-set for the resume
///   path: `suspended` goes to `running` in one operation, so two
///   approvers racing the same gate get exactly one winner.
/// - A step's settled status (`completed`/`failed`/`skipped`) is written
///   exactly once.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Persists a new run.
    async fn create_run(&self, run: WorkflowRun) -> Result<(), RepositoryError>;

    /// Loads a run by id.
    async fn get_run(&self, run_id: WorkflowRunId) -> Result<WorkflowRun, RepositoryError>;

    /// Applies a status transition to a run.
    async fn update_run_status(
        &self,
        run_id: WorkflowRunId,
        update: RunUpdate,
    ) -> Result<(), RepositoryError>;

    /// Appends a step record.
    async fn append_step(&self, step: WorkflowStep) -> Result<(), RepositoryError>;

    /// Applies a status transition to a step.
    async fn update_step(
        &self,
        step_id: WorkflowStepId,
        update: StepUpdate,
    ) -> Result<(), RepositoryError>;

    /// Lists a run's steps in step-number order.
    async fn list_steps(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Vec<WorkflowStep>, RepositoryError>;

    /// Lists runs with the given status whose `updated_at` is older than
    /// the cutoff.
    async fn list_stale(
        &self,
        status: RunStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRun>, RepositoryError>;

    /// Atomically claims a stale running run for recovery.
    ///
    /// Returns the run if it was still `running` with `updated_at` older
    /// than the cutoff; touches `updated_at` so a second claim finds
    /// nothing.
    async fn claim_stale_run(
        &self,
        run_id: WorkflowRunId,
        older_than: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, RepositoryError>;

    /// Atomically transitions a suspended run to running for resume.
    ///
    /// Returns false when the run is not currently `suspended` (another
    /// approver or the sweeper got there first). The stored engine state
    /// is kept through the transition so a crash mid-resume stays
    /// recoverable.
    async fn claim_suspended_run(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<bool, RepositoryError>;

    /// Requests cancellation of a run.
    async fn request_cancel(&self, run_id: WorkflowRunId) -> Result<(), RepositoryError>;

    /// Returns true if cancellation has been requested for the run.
    async fn is_cancel_requested(&self, run_id: WorkflowRunId)
    -> Result<bool, RepositoryError>;
}

/// Storage interface for definition versions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Stores a definition version.
    async fn put(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError>;

    /// Loads a specific definition version.
    async fn get(
        &self,
        workflow_id: WorkflowId,
        version: u32,
    ) -> Result<WorkflowDefinition, RepositoryError>;

    /// Loads the highest published version of a workflow.
    async fn latest_published(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDefinition, RepositoryError>;
}

fn poisoned() -> RepositoryError {
    RepositoryError::Unavailable {
        reason: "lock poisoned".to_string(),
    }
}

/// In-memory run repository.
#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: RwLock<HashMap<WorkflowRunId, WorkflowRun>>,
    steps: RwLock<HashMap<WorkflowRunId, Vec<WorkflowStep>>>,
    cancel_requests: RwLock<HashSet<WorkflowRunId>>,
}

impl InMemoryRunRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdates a run's `updated_at` (test support for staleness paths).
    ///
    /// # Errors
    ///
    /// Returns an error if the run does not exist.
    pub fn backdate_run(
        &self,
        run_id: WorkflowRunId,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        let run = runs
            .get_mut(&run_id)
            .ok_or(RepositoryError::RunNotFound { run_id })?;
        run.updated_at = updated_at;
        Ok(())
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, run: WorkflowRun) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: WorkflowRunId) -> Result<WorkflowRun, RepositoryError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        runs.get(&run_id)
            .cloned()
            .ok_or(RepositoryError::RunNotFound { run_id })
    }

    async fn update_run_status(
        &self,
        run_id: WorkflowRunId,
        update: RunUpdate,
    ) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        let run = runs
            .get_mut(&run_id)
            .ok_or(RepositoryError::RunNotFound { run_id })?;

        let now = Utc::now();
        run.status = update.status;
        run.updated_at = now;
        if update.status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if update.status.is_terminal() {
            run.completed_at = Some(now);
        }
        if let Some(output) = update.output {
            run.output = Some(output);
        }
        if let Some(error) = update.error {
            run.error = Some(error);
        }
        match update.engine_state {
            EngineStateUpdate::Keep => {}
            EngineStateUpdate::Clear => run.engine_state = None,
            EngineStateUpdate::Set(state) => run.engine_state = Some(state),
        }
        Ok(())
    }

    async fn append_step(&self, step: WorkflowStep) -> Result<(), RepositoryError> {
        let mut steps = self.steps.write().map_err(|_| poisoned())?;
        steps.entry(step.run_id).or_default().push(step);
        Ok(())
    }

    async fn update_step(
        &self,
        step_id: WorkflowStepId,
        update: StepUpdate,
    ) -> Result<(), RepositoryError> {
        let mut steps = self.steps.write().map_err(|_| poisoned())?;
        let step = steps
            .values_mut()
            .flatten()
            .find(|s| s.id == step_id)
            .ok_or(RepositoryError::StepNotFound { step_id })?;

        step.status = update.status;
        if let Some(output) = update.output {
            step.output = Some(output);
        }
        if let Some(error) = update.error {
            step.error = Some(error);
        }
        if matches!(
            update.status,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        ) {
            let now = Utc::now();
            step.completed_at = Some(now);
            let elapsed = now.signed_duration_since(step.started_at);
            step.duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
        }
        Ok(())
    }

    async fn list_steps(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Vec<WorkflowStep>, RepositoryError> {
        let steps = self.steps.read().map_err(|_| poisoned())?;
        let mut result = steps.get(&run_id).cloned().unwrap_or_default();
        result.sort_by_key(|s| s.step_number);
        Ok(result)
    }

    async fn list_stale(
        &self,
        status: RunStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        Ok(runs
            .values()
            .filter(|r| r.status == status && r.updated_at < older_than)
            .cloned()
            .collect())
    }

    async fn claim_stale_run(
        &self,
        run_id: WorkflowRunId,
        older_than: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        let Some(run) = runs.get_mut(&run_id) else {
            return Ok(None);
        };
        if run.status != RunStatus::Running || run.updated_at >= older_than {
            return Ok(None);
        }
        run.updated_at = Utc::now();
        Ok(Some(run.clone()))
    }

    async fn claim_suspended_run(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<bool, RepositoryError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        let run = runs
            .get_mut(&run_id)
            .ok_or(RepositoryError::RunNotFound { run_id })?;
        if run.status != RunStatus::Suspended {
            return Ok(false);
        }
        run.status = RunStatus::Running;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn request_cancel(&self, run_id: WorkflowRunId) -> Result<(), RepositoryError> {
        let mut requests = self.cancel_requests.write().map_err(|_| poisoned())?;
        requests.insert(run_id);
        Ok(())
    }

    async fn is_cancel_requested(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<bool, RepositoryError> {
        let requests = self.cancel_requests.read().map_err(|_| poisoned())?;
        Ok(requests.contains(&run_id))
    }
}

/// In-memory definition store.
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<HashMap<(WorkflowId, u32), WorkflowDefinition>>,
}

impl InMemoryDefinitionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn put(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut definitions = self.definitions.write().map_err(|_| poisoned())?;
        definitions.insert((definition.id, definition.version), definition);
        Ok(())
    }

    async fn get(
        &self,
        workflow_id: WorkflowId,
        version: u32,
    ) -> Result<WorkflowDefinition, RepositoryError> {
        let definitions = self.definitions.read().map_err(|_| poisoned())?;
        definitions
            .get(&(workflow_id, version))
            .cloned()
            .ok_or(RepositoryError::DefinitionNotFound {
                workflow_id,
                version,
            })
    }

    async fn latest_published(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDefinition, RepositoryError> {
        let definitions = self.definitions.read().map_err(|_| poisoned())?;
        definitions
            .values()
            .filter(|d| d.id == workflow_id && d.is_published())
            .max_by_key(|d| d.version)
            .cloned()
            .ok_or(RepositoryError::DefinitionNotFound {
                workflow_id,
                version: 0,
            })
    }
}
