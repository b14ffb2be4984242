//! The periodic recovery schedule.
//!
//! Drives the recovery sweeper on a fixed interval. Sweep failures are
//! logged and the schedule keeps ticking; a broken database connection
//! this minute should not stop recovery next minute.

use nimbus_workflow::recovery::RecoverySweeper;
use nimbus_workflow::{EngineError, SweepReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Default sweep interval, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Runs the recovery sweeper on an interval until shut down.
pub struct RecoverySchedule {
    sweeper: Arc<RecoverySweeper>,
    every: Duration,
}

impl RecoverySchedule {
    /// Creates a schedule with the default interval.
    #[must_use]
    pub fn new(sweeper: Arc<RecoverySweeper>) -> Self {
        Self {
            sweeper,
            every: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }

    /// Overrides the sweep interval.
    #[must_use]
    pub fn with_interval(mut self, every: Duration) -> Self {
        self.every = every;
        self
    }

    /// Runs one sweep immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the stale-run query fails.
    pub async fn run_once(&self) -> Result<SweepReport, EngineError> {
        self.sweeper.sweep().await
    }

    /// Ticks until the shutdown channel signals.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup and the
        // first sweep are not entangled.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweeper.sweep().await {
                        tracing::warn!(error = %e, "recovery sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("recovery schedule stopping");
                        return;
                    }
                }
            }
        }
    }
}
