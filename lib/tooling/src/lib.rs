//! Tool catalog boundary and risk classification for the nimbus platform.
//!
//! This crate provides:
//!
//! - **Tool trait**: The capability interface every cloud-provider tool
//!   implements (name, parameter schema, approval level, async invoke)
//! - **Registry**: An immutable, name-keyed catalog built once at startup
//! - **Risk**: The approval-level to risk-level mapping and the configurable
//!   threshold policy that decides which calls need human approval
//!
//! Tool implementations themselves (SDK/CLI wrappers for compute, storage,
//! database, identity, billing) live outside this workspace; the engine only
//! consumes the interface defined here.

pub mod error;
pub mod registry;
pub mod risk;
pub mod tool;

pub use error::ToolError;
pub use registry::ToolRegistry;
pub use risk::{ApprovalPolicy, RiskLevel};
pub use tool::{ApprovalLevel, EchoTool, FailingTool, StaticTool, Tool};
