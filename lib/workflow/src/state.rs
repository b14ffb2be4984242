//! Engine state: the durable checkpoint of a suspended run.
//!
//! The snapshot holds the suspended node, the variable environment, the
//! next step number, and a frame stack locating the suspension point
//! inside nested loop/parallel bodies. It must round-trip through plain
//! JSON; after writing it the executor holds no in-memory state for the
//! run.

use crate::envelope::{CURRENT_VERSION, Envelope, RawEnvelope};
use crate::error::StateError;
use crate::node::NodeId;
use nimbus_core::WorkflowStepId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One level of nesting between the run's top level and the suspended
/// node. Frames are ordered outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Suspension inside a loop body.
    Loop {
        /// The loop node.
        node: NodeId,
        /// The loop node's own (suspended) step record.
        step: WorkflowStepId,
        /// Completed iteration count at suspension.
        iteration: u32,
        /// Index into the body where the suspension happened.
        body_index: usize,
    },
    /// Suspension inside a parallel branch.
    Parallel {
        /// The parallel node.
        node: NodeId,
        /// The parallel node's own (suspended) step record.
        step: WorkflowStepId,
        /// Index of the suspended branch.
        branch: usize,
        /// Index into the branch where the suspension happened.
        position: usize,
        /// Branches already settled at suspension; not re-run on resume.
        #[serde(default)]
        settled: Vec<usize>,
    },
}

impl Frame {
    /// The composite node this frame belongs to.
    #[must_use]
    pub fn node(&self) -> NodeId {
        match self {
            Self::Loop { node, .. } | Self::Parallel { node, .. } => *node,
        }
    }
}

/// The serializable snapshot of a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Definition version the snapshot was written against.
    pub workflow_version: u32,
    /// The node awaiting a decision.
    pub node: NodeId,
    /// The step record appended for the awaiting node.
    pub pending_step: WorkflowStepId,
    /// The variable environment at the suspension point.
    pub environment: JsonValue,
    /// The next step number to assign on resume.
    pub next_step_number: u32,
    /// Nesting frames, outermost first; empty for a top-level suspension.
    pub frames: Vec<Frame>,
}

impl EngineState {
    /// Encodes the state into its persisted envelope form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<JsonValue, StateError> {
        serde_json::to_value(Envelope::new(self)).map_err(|e| StateError::EncodeFailed {
            reason: e.to_string(),
        })
    }

    /// Decodes a persisted envelope back into engine state.
    ///
    /// # Errors
    ///
    /// Returns a typed error for an unsupported envelope version or an
    /// undecodable payload; never panics on malformed input.
    pub fn decode(value: JsonValue) -> Result<Self, StateError> {
        let raw: RawEnvelope =
            serde_json::from_value(value).map_err(|e| StateError::DecodeFailed {
                reason: e.to_string(),
            })?;
        if raw.version != CURRENT_VERSION {
            return Err(StateError::UnsupportedEnvelope {
                version: raw.version,
            });
        }
        raw.deserialize_payload::<Self>()
            .map(Envelope::into_payload)
            .map_err(|e| StateError::DecodeFailed {
                reason: e.to_string(),
            })
    }
}
