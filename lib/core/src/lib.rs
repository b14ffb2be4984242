//! Core domain types for the nimbus cloud-operations platform.
//!
//! This crate provides the foundational identifier types shared by the
//! tool catalog, the workflow engine, and the scheduler.

pub mod id;

pub use id::{OrgId, UserId, WorkflowId, WorkflowRunId, WorkflowStepId};
