//! Crash recovery for orphaned runs.
//!
//! A run stuck in `running` whose `updated_at` stopped moving belongs to
//! an executor that died. The sweeper claims each such run atomically
//! (single writer), then re-drives it: from its checkpoint when one was
//! written, otherwise from the original input. Suspended runs are never
//! touched; they are waiting on a human, not on a crashed process.

use crate::error::EngineError;
use crate::executor::WorkflowExecutor;
use crate::repository::{DefinitionStore, RunRepository};
use crate::run::RunStatus;
use crate::state::EngineState;
use chrono::{DateTime, Duration, Utc};
use nimbus_core::WorkflowRunId;
use std::sync::Arc;

/// Default staleness horizon, in seconds.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 300;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Stale candidates the sweep looked at.
    pub examined: usize,
    /// Runs successfully re-driven (to any outcome, including
    /// re-suspension at their gate).
    pub restarted: usize,
    /// Runs whose recovery itself failed.
    pub failed: usize,
}

/// Periodically re-drives runs orphaned by an executor crash.
pub struct RecoverySweeper {
    executor: Arc<WorkflowExecutor>,
    repository: Arc<dyn RunRepository>,
    definitions: Arc<dyn DefinitionStore>,
    stale_after: Duration,
}

impl RecoverySweeper {
    /// Creates a sweeper with the default staleness horizon.
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
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
        }
    }

    /// Overrides the staleness horizon.
    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sweeps once.
    ///
    /// One broken run never blocks the rest: per-run recovery failures
    /// are logged and counted, and the sweep moves on. A repeated sweep
    /// is harmless; claiming touches `updated_at`, so a just-claimed run
    /// is no longer stale.
    ///
    /// # Errors
    ///
    /// Returns an error only if the stale-run query itself fails.
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let cutoff = Utc::now() - self.stale_after;
        let candidates = self
            .repository
            .list_stale(RunStatus::Running, cutoff)
            .await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };
        for candidate in candidates {
            match self.redrive(candidate.id, cutoff).await {
                Ok(true) => report.restarted += 1,
                // Lost the claim; another sweeper or the original
                // executor got there first.
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(run = %candidate.id, error = %e, "recovery of run failed");
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            restarted = report.restarted,
            failed = report.failed,
            "recovery sweep finished"
        );
        Ok(report)
    }

    async fn redrive(
        &self,
        run_id: WorkflowRunId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let Some(run) = self.repository.claim_stale_run(run_id, cutoff).await? else {
            return Ok(false);
        };
        let definition = self
            .definitions
            .get(run.workflow_id, run.workflow_version)
            .await?;

        match run.engine_state.clone() {
            Some(raw) => {
                // Crashed after a checkpoint was written. No decision is
                // available, so the run re-suspends at its gate.
                let state = EngineState::decode(raw)?;
                tracing::info!(run = %run_id, node = %state.node, "re-driving run from checkpoint");
                self.executor.resume(&definition, &run, state, None).await?;
            }
            None => {
                // Crashed before any suspension point; replay from the
                // input. Step numbering continues past the dead attempt.
                tracing::info!(run = %run_id, "re-driving run from its input");
                self.executor.execute(&definition, &run).await?;
            }
        }
        Ok(true)
    }
}
