//! Model access primitives for the nimbus platform.
//!
//! This crate provides:
//!
//! - **Backend**: The provider-agnostic inference interface the engine
//!   calls for AI steps, plus scripted/failing doubles for tests
//! - **Prompt**: Strict `{{path}}` template rendering against a JSON
//!   context
//!
//! Provider adapters (HTTP clients for the actual APIs) live outside this
//! workspace; the engine only consumes the interface defined here.

pub mod backend;
pub mod error;
pub mod prompt;

pub use backend::{
    FailingBackend, ModelBackend, ModelBackendConfig, ModelProvider, ModelRequest, ModelResponse,
    ScriptedBackend, TokenUsage,
};
pub use error::{ModelError, PromptError};
