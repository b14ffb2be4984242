//! Triggers and recovery scheduling for nimbus workflow runs.
//!
//! This crate provides the thin drivers around the workflow engine:
//!
//! - **Analysis Trigger**: starts a run from the latest published
//!   definition of a workflow
//! - **Recovery Schedule**: drives the crash-recovery sweeper on a fixed
//!   interval

pub mod schedule;
pub mod trigger;

pub use schedule::RecoverySchedule;
pub use trigger::{AnalysisTrigger, RunRequest, TriggeredRun};
