//! Engine configuration.
//!
//! Loaded from the environment under the `NIMBUS_` prefix with `__` as
//! the nesting separator (`NIMBUS_APPROVAL_THRESHOLD=high`). Anything
//! unset falls back to a safe default; a misconfigured deployment must
//! never come up approval-free.

use chrono::Duration;
use nimbus_tooling::{ApprovalPolicy, RiskLevel};
use serde::Deserialize;

fn default_approval_threshold() -> RiskLevel {
    RiskLevel::Medium
}

fn default_max_loop_iterations() -> u32 {
    crate::executor::DEFAULT_LOOP_CAP
}

fn default_stale_after_secs() -> i64 {
    crate::recovery::DEFAULT_STALE_AFTER_SECS
}

/// Tunables for the workflow engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Risk level at/above which tool calls require approval.
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: RiskLevel,
    /// Iteration cap for loop nodes without their own.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
    /// Seconds a running run may sit untouched before the recovery
    /// sweeper considers it orphaned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            approval_threshold: default_approval_threshold(),
            max_loop_iterations: default_max_loop_iterations(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl EngineConfig {
    /// Loads the configuration from the environment.
    ///
    /// Invalid or missing values fall back to defaults with a logged
    /// warning.
    #[must_use]
    pub fn from_env() -> Self {
        let loaded = config::Config::builder()
            .add_source(config::Environment::with_prefix("NIMBUS").separator("__"))
            .build()
            .and_then(config::Config::try_deserialize);

        match loaded {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "falling back to default engine configuration");
                Self::default()
            }
        }
    }

    /// The approval policy this configuration implies.
    #[must_use]
    pub fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::new(self.approval_threshold)
    }

    /// The staleness horizon as a duration.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs)
    }
}
