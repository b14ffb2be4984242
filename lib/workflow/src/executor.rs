//! The workflow executor state machine.
//!
//! Walks a definition graph node by node, recording step transitions
//! through the run repository, consulting the approval policy before any
//! tool runs, and suspending to a durable checkpoint whenever a human
//! decision is required. Resume re-enters the traversal at the stored
//! node, continuing step numbering from where it left off.
//!
//! Run-failing conditions (tool errors, loop limits, rejected approvals)
//! are converted into step/run failure records and never escape as
//! panics; repository errors are always re-raised so a caller never sees
//! "advanced" state that was not durably recorded.

use crate::approval::ApprovalDecision;
use crate::definition::WorkflowDefinition;
use crate::error::{ApprovalError, EngineError, ExecutionError, GraphError, StateError};
use crate::node::{JoinPolicy, Node, NodeId, NodeKind};
use crate::predicate::Predicate;
use crate::repository::{RunRepository, RunUpdate, StepUpdate};
use crate::run::{RunStatus, StepStatus, WorkflowRun, WorkflowStep};
use crate::state::{EngineState, Frame};
use crate::template;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use nimbus_ai::{ModelBackend, ModelRequest};
use nimbus_core::{WorkflowRunId, WorkflowStepId};
use nimbus_tooling::{ApprovalPolicy, ToolRegistry};
use serde_json::{Value as JsonValue, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Default iteration cap for loop nodes that do not set their own.
pub const DEFAULT_LOOP_CAP: u32 = 100;

/// Outcome of an execute/resume call.
///
/// `engine_state` is populated only when the status is `suspended`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Final run status.
    pub status: RunStatus,
    /// Run output (if completed).
    pub output: Option<JsonValue>,
    /// Run error (if failed).
    pub error: Option<String>,
    /// The checkpoint (if suspended).
    pub engine_state: Option<EngineState>,
}

impl ExecutionResult {
    fn completed(output: JsonValue) -> Self {
        Self {
            status: RunStatus::Completed,
            output: Some(output),
            error: None,
            engine_state: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            output: None,
            error: Some(error.into()),
            engine_state: None,
        }
    }

    fn suspended(state: EngineState) -> Self {
        Self {
            status: RunStatus::Suspended,
            output: None,
            error: None,
            engine_state: Some(state),
        }
    }

    fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            output: None,
            error: None,
            engine_state: None,
        }
    }
}

/// Run-wide step number source. Shared by every fork of the traversal
/// context so numbers stay unique across concurrent parallel branches.
#[derive(Clone)]
struct StepCounter(Arc<AtomicU32>);

impl StepCounter {
    fn starting_at(start: u32) -> Self {
        Self(Arc::new(AtomicU32::new(start)))
    }

    fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    fn peek(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Traversal bookkeeping for one execute/resume call.
struct RunCtx<'a> {
    definition: &'a WorkflowDefinition,
    run_id: WorkflowRunId,
    steps: StepCounter,
    environment: JsonValue,
}

impl<'a> RunCtx<'a> {
    fn take_step_number(&self) -> u32 {
        self.steps.next()
    }

    /// A branch-local copy: own environment, shared step numbering.
    fn fork(&self) -> RunCtx<'a> {
        RunCtx {
            definition: self.definition,
            run_id: self.run_id,
            steps: self.steps.clone(),
            environment: self.environment.clone(),
        }
    }
}

/// A suspension bubbling up from the dispatch site to the top level.
/// Enclosing loop/parallel handlers prepend their frame on the way up.
struct Suspension {
    node: NodeId,
    pending_step: WorkflowStepId,
    frames: Vec<Frame>,
}

/// Routing information for re-entering a suspended traversal.
struct ResumeToken {
    frames: VecDeque<Frame>,
    node: NodeId,
    pending_step: WorkflowStepId,
    decision: Option<ApprovalDecision>,
}

/// What a node dispatch tells the enclosing traversal to do next.
enum Flow {
    Next,
    Goto(NodeId),
    Suspend(Suspension),
    Output(JsonValue),
    Fault(ExecutionError),
    Cancelled,
}

/// Same, for a body sequence inside a loop/parallel node.
enum BodyFlow {
    Completed,
    Suspended { suspension: Suspension, at: usize },
    Fault(ExecutionError),
    Cancelled,
}

fn bind(environment: &mut JsonValue, key: &str, value: JsonValue) {
    if let Some(map) = environment.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

/// Folds a settled branch's bindings back into the parent environment.
fn merge_environment(environment: &mut JsonValue, branch: &JsonValue) {
    if let (Some(parent), Some(branch)) = (environment.as_object_mut(), branch.as_object()) {
        for (key, value) in branch {
            parent.insert(key.clone(), value.clone());
        }
    }
}

/// The workflow execution engine.
pub struct WorkflowExecutor {
    repository: Arc<dyn RunRepository>,
    registry: Arc<ToolRegistry>,
    policy: ApprovalPolicy,
    backend: Arc<dyn ModelBackend>,
    max_loop_iterations: u32,
}

impl WorkflowExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        repository: Arc<dyn RunRepository>,
        registry: Arc<ToolRegistry>,
        policy: ApprovalPolicy,
        backend: Arc<dyn ModelBackend>,
    ) -> Self {
        Self {
            repository,
            registry,
            policy,
            backend,
            max_loop_iterations: DEFAULT_LOOP_CAP,
        }
    }

    /// Overrides the default loop iteration cap.
    #[must_use]
    pub fn with_max_loop_iterations(mut self, cap: u32) -> Self {
        self.max_loop_iterations = cap;
        self
    }

    /// Persists a new run and executes it.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid definitions or repository failures.
    /// Run-level failures are reported in the result, not as errors.
    pub async fn start(
        &self,
        definition: &WorkflowDefinition,
        run: WorkflowRun,
    ) -> Result<ExecutionResult, EngineError> {
        self.repository.create_run(run.clone()).await?;
        self.execute(definition, &run).await
    }

    /// Executes a run from its input node.
    ///
    /// Step numbering continues after any steps already recorded for the
    /// run, so a recovery re-execution never resets the order.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid definitions or repository failures.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
    ) -> Result<ExecutionResult, EngineError> {
        definition.graph.validate()?;
        let Some(entry) = definition.graph.entry_node() else {
            return Err(GraphError::NoEntryNode.into());
        };

        self.repository
            .update_run_status(run.id, RunUpdate::running())
            .await?;
        tracing::info!(
            run = %run.id,
            workflow = %run.workflow_id,
            version = run.workflow_version,
            "run started"
        );

        let existing = self.repository.list_steps(run.id).await?;
        let next_step = existing.last().map_or(1, |s| s.step_number + 1);

        let mut ctx = RunCtx {
            definition,
            run_id: run.id,
            steps: StepCounter::starting_at(next_step),
            environment: json!({ "input": run.input.clone() }),
        };
        self.run_from(&mut ctx, entry, None).await
    }

    /// Resumes a suspended run from its checkpoint.
    ///
    /// With a decision, the pending gate is settled (rejection fails the
    /// run); without one, the run re-suspends at the same gate after the
    /// checkpoint is re-established. State referencing nodes the
    /// definition no longer has, or a mismatched version, is rejected
    /// before any status transition, so the run stays suspended. A
    /// suspended run is then claimed atomically; of two racing resumes
    /// only one proceeds, and the gated action runs at most once.
    ///
    /// # Errors
    ///
    /// Returns a `StateError` for stale state, an `ApprovalError` when
    /// the claim is lost, or repository failures.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        state: EngineState,
        decision: Option<ApprovalDecision>,
    ) -> Result<ExecutionResult, EngineError> {
        if state.workflow_version != definition.version {
            return Err(StateError::VersionMismatch {
                expected: definition.version,
                found: state.workflow_version,
            }
            .into());
        }
        if !definition.graph.contains(state.node) {
            return Err(StateError::NodeMissing { node_id: state.node }.into());
        }
        for frame in &state.frames {
            if !definition.graph.contains(frame.node()) {
                return Err(StateError::NodeMissing {
                    node_id: frame.node(),
                }
                .into());
            }
        }

        match run.status {
            // The claim is a compare-and-set: racing approvers get
            // exactly one winner, and the loser never touches the run.
            RunStatus::Suspended => {
                if !self.repository.claim_suspended_run(run.id).await? {
                    let current = self.repository.get_run(run.id).await?;
                    return Err(ApprovalError::RunNotSuspended {
                        run_id: run.id,
                        status: current.status.to_string(),
                    }
                    .into());
                }
            }
            // A stale running run re-driven by the sweeper already holds
            // the claim taken by `claim_stale_run`.
            RunStatus::Running => {}
            other => {
                return Err(ApprovalError::RunNotSuspended {
                    run_id: run.id,
                    status: other.to_string(),
                }
                .into());
            }
        }
        tracing::info!(run = %run.id, node = %state.node, "run resumed");

        let start = state.frames.first().map_or(state.node, Frame::node);
        let mut ctx = RunCtx {
            definition,
            run_id: run.id,
            steps: StepCounter::starting_at(state.next_step_number),
            environment: state.environment,
        };
        let token = ResumeToken {
            frames: state.frames.into(),
            node: state.node,
            pending_step: state.pending_step,
            decision,
        };
        self.run_from(&mut ctx, start, Some(token)).await
    }

    /// Top-level traversal: one iteration per node visit, following the
    /// unlabeled outgoing edge (or a condition's chosen branch).
    async fn run_from(
        &self,
        ctx: &mut RunCtx<'_>,
        start: NodeId,
        mut resume: Option<ResumeToken>,
    ) -> Result<ExecutionResult, EngineError> {
        let mut current = Some(start);
        let mut last = start;
        while let Some(node_id) = current {
            last = node_id;
            if self.repository.is_cancel_requested(ctx.run_id).await? {
                return self.finish_cancelled(ctx).await;
            }
            match self.dispatch(ctx, node_id, resume.take()).await? {
                Flow::Next => current = ctx.definition.graph.successor(node_id),
                Flow::Goto(target) => current = Some(target),
                Flow::Output(output) => {
                    self.repository
                        .update_run_status(ctx.run_id, RunUpdate::completed(output.clone()))
                        .await?;
                    tracing::info!(run = %ctx.run_id, "run completed");
                    return Ok(ExecutionResult::completed(output));
                }
                Flow::Suspend(suspension) => {
                    let state = EngineState {
                        workflow_version: ctx.definition.version,
                        node: suspension.node,
                        pending_step: suspension.pending_step,
                        environment: ctx.environment.clone(),
                        next_step_number: ctx.steps.peek(),
                        frames: suspension.frames,
                    };
                    let encoded = state.encode()?;
                    self.repository
                        .update_run_status(ctx.run_id, RunUpdate::suspended(encoded))
                        .await?;
                    tracing::info!(run = %ctx.run_id, node = %state.node, "run suspended awaiting approval");
                    return Ok(ExecutionResult::suspended(state));
                }
                Flow::Fault(err) => {
                    let message = err.to_string();
                    self.repository
                        .update_run_status(ctx.run_id, RunUpdate::failed(message.clone()))
                        .await?;
                    tracing::warn!(run = %ctx.run_id, error = %message, "run failed");
                    return Ok(ExecutionResult::failed(message));
                }
                Flow::Cancelled => return self.finish_cancelled(ctx).await,
            }
        }

        let err = ExecutionError::NoOutputReached { node_id: last };
        self.repository
            .update_run_status(ctx.run_id, RunUpdate::failed(err.to_string()))
            .await?;
        Ok(ExecutionResult::failed(err.to_string()))
    }

    async fn finish_cancelled(&self, ctx: &RunCtx<'_>) -> Result<ExecutionResult, EngineError> {
        self.repository
            .update_run_status(ctx.run_id, RunUpdate::cancelled())
            .await?;
        tracing::info!(run = %ctx.run_id, "run cancelled");
        Ok(ExecutionResult::cancelled())
    }

    async fn dispatch(
        &self,
        ctx: &mut RunCtx<'_>,
        node_id: NodeId,
        resume: Option<ResumeToken>,
    ) -> Result<Flow, EngineError> {
        let node = match ctx.definition.graph.node(node_id) {
            Some(node) => node.clone(),
            None => return Err(StateError::NodeMissing { node_id }.into()),
        };
        tracing::debug!(run = %ctx.run_id, node = %node_id, kind = node.kind.name(), "dispatching node");
        match &node.kind {
            NodeKind::Input => self.run_input(ctx, &node).await,
            NodeKind::Output { mapping } => self.run_output(ctx, &node, mapping).await,
            NodeKind::Tool {
                tool_name,
                arguments,
            } => self.run_tool(ctx, &node, tool_name, arguments, resume).await,
            NodeKind::Condition { branches } => self.run_condition(ctx, &node, branches).await,
            NodeKind::Approval { message } => {
                self.run_approval(ctx, &node, message, resume).await
            }
            NodeKind::AiStep { prompt, bind_to } => {
                self.run_ai_step(ctx, &node, prompt, bind_to).await
            }
            NodeKind::Loop {
                body,
                until,
                max_iterations,
            } => {
                self.run_loop(ctx, &node, body, until, *max_iterations, resume)
                    .await
            }
            NodeKind::Parallel { branches, join } => {
                self.run_parallel(ctx, &node, branches, *join, resume).await
            }
        }
    }

    async fn append_step(
        &self,
        ctx: &RunCtx<'_>,
        node: &Node,
        status: StepStatus,
        input: Option<JsonValue>,
    ) -> Result<WorkflowStepId, EngineError> {
        let number = ctx.take_step_number();
        let step = WorkflowStep::new(ctx.run_id, node.id, node.kind.name(), number, status, input);
        let step_id = step.id;
        self.repository.append_step(step).await?;
        Ok(step_id)
    }

    async fn run_input(&self, ctx: &mut RunCtx<'_>, node: &Node) -> Result<Flow, EngineError> {
        let input = ctx.environment.get("input").cloned();
        let step = self.append_step(ctx, node, StepStatus::Running, input).await?;
        self.repository
            .update_step(step, StepUpdate::completed(None))
            .await?;
        Ok(Flow::Next)
    }

    async fn run_output(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        mapping: &JsonValue,
    ) -> Result<Flow, EngineError> {
        let step = self.append_step(ctx, node, StepStatus::Running, None).await?;
        match template::resolve(mapping, &ctx.environment) {
            Ok(output) => {
                self.repository
                    .update_step(step, StepUpdate::completed(Some(output.clone())))
                    .await?;
                Ok(Flow::Output(output))
            }
            Err(e) => {
                let err = ExecutionError::TemplateFailed {
                    node_id: node.id,
                    reason: e.to_string(),
                };
                self.repository
                    .update_step(step, StepUpdate::failed(err.to_string()))
                    .await?;
                Ok(Flow::Fault(err))
            }
        }
    }

    async fn run_tool(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        tool_name: &str,
        arguments: &JsonValue,
        resume: Option<ResumeToken>,
    ) -> Result<Flow, EngineError> {
        let args = match template::resolve(arguments, &ctx.environment) {
            Ok(args) => args,
            Err(e) => {
                let err = ExecutionError::TemplateFailed {
                    node_id: node.id,
                    reason: e.to_string(),
                };
                let step = self.append_step(ctx, node, StepStatus::Running, None).await?;
                self.repository
                    .update_step(step, StepUpdate::failed(err.to_string()))
                    .await?;
                return Ok(Flow::Fault(err));
            }
        };

        if let Some(token) = resume {
            return self
                .settle_gate(ctx, node, token, Some((tool_name, args)))
                .await;
        }

        if self.policy.requires_approval(&self.registry, tool_name) {
            tracing::info!(
                run = %ctx.run_id,
                node = %node.id,
                tool = tool_name,
                "tool requires approval, suspending"
            );
            let step = self
                .append_step(ctx, node, StepStatus::Suspended, Some(args))
                .await?;
            return Ok(Flow::Suspend(Suspension {
                node: node.id,
                pending_step: step,
                frames: Vec::new(),
            }));
        }

        let step = self
            .append_step(ctx, node, StepStatus::Running, Some(args.clone()))
            .await?;
        self.invoke_tool(ctx, node, tool_name, args, step).await
    }

    async fn invoke_tool(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        tool_name: &str,
        args: JsonValue,
        step: WorkflowStepId,
    ) -> Result<Flow, EngineError> {
        match self.registry.invoke(tool_name, args).await {
            Ok(result) => {
                self.repository
                    .update_step(step, StepUpdate::completed(Some(result.clone())))
                    .await?;
                bind(&mut ctx.environment, &node.name, result);
                Ok(Flow::Next)
            }
            Err(e) => {
                let err = ExecutionError::ToolFailed {
                    node_id: node.id,
                    tool_name: tool_name.to_string(),
                    reason: e.to_string(),
                };
                self.repository
                    .update_step(step, StepUpdate::failed(err.to_string()))
                    .await?;
                Ok(Flow::Fault(err))
            }
        }
    }

    /// Settles a suspended gate (tool awaiting approval, or an approval
    /// node) from a resume token. Without a decision the gate re-suspends
    /// unchanged; rejection skips the step and fails the run; approval
    /// runs the gated action.
    async fn settle_gate(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        token: ResumeToken,
        action: Option<(&str, JsonValue)>,
    ) -> Result<Flow, EngineError> {
        if token.node != node.id || !token.frames.is_empty() {
            return Err(StateError::DecodeFailed {
                reason: format!("suspension frames do not lead to node {}", node.id),
            }
            .into());
        }
        match token.decision {
            None => Ok(Flow::Suspend(Suspension {
                node: node.id,
                pending_step: token.pending_step,
                frames: Vec::new(),
            })),
            Some(decision) if !decision.approved => {
                self.repository
                    .update_step(token.pending_step, StepUpdate::skipped("rejected by approver"))
                    .await?;
                Ok(Flow::Fault(ExecutionError::ApprovalRejected {
                    node_id: node.id,
                }))
            }
            Some(_) => match action {
                Some((tool_name, args)) => {
                    self.invoke_tool(ctx, node, tool_name, args, token.pending_step)
                        .await
                }
                None => {
                    self.repository
                        .update_step(token.pending_step, StepUpdate::completed(None))
                        .await?;
                    Ok(Flow::Next)
                }
            },
        }
    }

    async fn run_condition(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        branches: &[crate::node::ConditionBranch],
    ) -> Result<Flow, EngineError> {
        let step = self.append_step(ctx, node, StepStatus::Running, None).await?;
        for branch in branches {
            if branch.predicate.evaluate(&ctx.environment) {
                if let Some(target) = ctx.definition.graph.labeled_successor(node.id, &branch.label)
                {
                    self.repository
                        .update_step(
                            step,
                            StepUpdate::completed(Some(json!({ "branch": branch.label }))),
                        )
                        .await?;
                    return Ok(Flow::Goto(target));
                }
            }
        }
        let err = ExecutionError::NoMatchingBranch { node_id: node.id };
        self.repository
            .update_step(step, StepUpdate::failed(err.to_string()))
            .await?;
        Ok(Flow::Fault(err))
    }

    async fn run_approval(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        message: &str,
        resume: Option<ResumeToken>,
    ) -> Result<Flow, EngineError> {
        if let Some(token) = resume {
            return self.settle_gate(ctx, node, token, None).await;
        }
        tracing::info!(run = %ctx.run_id, node = %node.id, "approval gate, suspending");
        let step = self
            .append_step(
                ctx,
                node,
                StepStatus::Suspended,
                Some(json!({ "message": message })),
            )
            .await?;
        Ok(Flow::Suspend(Suspension {
            node: node.id,
            pending_step: step,
            frames: Vec::new(),
        }))
    }

    async fn run_ai_step(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        prompt: &str,
        bind_to: &str,
    ) -> Result<Flow, EngineError> {
        let rendered = match nimbus_ai::prompt::render(prompt, &ctx.environment) {
            Ok(rendered) => rendered,
            Err(e) => {
                let err = ExecutionError::TemplateFailed {
                    node_id: node.id,
                    reason: e.to_string(),
                };
                let step = self.append_step(ctx, node, StepStatus::Running, None).await?;
                self.repository
                    .update_step(step, StepUpdate::failed(err.to_string()))
                    .await?;
                return Ok(Flow::Fault(err));
            }
        };
        let step = self
            .append_step(
                ctx,
                node,
                StepStatus::Running,
                Some(json!({ "prompt": rendered })),
            )
            .await?;
        match self.backend.generate(&ModelRequest::new(rendered)).await {
            Ok(response) => {
                let value = response.output_value();
                self.repository
                    .update_step(step, StepUpdate::completed(Some(value.clone())))
                    .await?;
                bind(&mut ctx.environment, bind_to, value);
                Ok(Flow::Next)
            }
            Err(e) => {
                let err = ExecutionError::ModelCallFailed {
                    node_id: node.id,
                    reason: e.to_string(),
                };
                self.repository
                    .update_step(step, StepUpdate::failed(err.to_string()))
                    .await?;
                Ok(Flow::Fault(err))
            }
        }
    }

    async fn run_loop(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        body: &[NodeId],
        until: &Predicate,
        max_iterations: Option<u32>,
        resume: Option<ResumeToken>,
    ) -> Result<Flow, EngineError> {
        let cap = max_iterations.unwrap_or(self.max_loop_iterations);
        let (loop_step, mut iteration, mut start_index, mut inner) = match resume {
            Some(mut token) => {
                let Some(Frame::Loop {
                    node: frame_node,
                    step,
                    iteration,
                    body_index,
                }) = token.frames.pop_front()
                else {
                    return Err(StateError::DecodeFailed {
                        reason: format!("suspension frames do not lead to node {}", node.id),
                    }
                    .into());
                };
                if frame_node != node.id {
                    return Err(StateError::NodeMissing { node_id: frame_node }.into());
                }
                (step, iteration, body_index, Some(token))
            }
            None => {
                let step = self.append_step(ctx, node, StepStatus::Running, None).await?;
                (step, 0u32, 0usize, None)
            }
        };

        loop {
            // A resumed partial iteration skips the checks; they already
            // ran when the iteration started.
            if inner.is_none() {
                if until.evaluate(&ctx.environment) {
                    self.repository
                        .update_step(
                            loop_step,
                            StepUpdate::completed(Some(json!({ "iterations": iteration }))),
                        )
                        .await?;
                    return Ok(Flow::Next);
                }
                if iteration >= cap {
                    let err = ExecutionError::LoopLimitExceeded {
                        node_id: node.id,
                        limit: cap,
                    };
                    self.repository
                        .update_step(loop_step, StepUpdate::failed(err.to_string()))
                        .await?;
                    return Ok(Flow::Fault(err));
                }
            }
            match self
                .run_body(ctx, node.id, body, start_index, inner.take())
                .await?
            {
                BodyFlow::Completed => {
                    iteration += 1;
                    start_index = 0;
                }
                BodyFlow::Suspended { mut suspension, at } => {
                    suspension.frames.insert(
                        0,
                        Frame::Loop {
                            node: node.id,
                            step: loop_step,
                            iteration,
                            body_index: at,
                        },
                    );
                    self.repository
                        .update_step(loop_step, StepUpdate::suspended())
                        .await?;
                    return Ok(Flow::Suspend(suspension));
                }
                BodyFlow::Fault(err) => {
                    self.repository
                        .update_step(loop_step, StepUpdate::failed(err.to_string()))
                        .await?;
                    return Ok(Flow::Fault(err));
                }
                BodyFlow::Cancelled => {
                    self.repository
                        .update_step(loop_step, StepUpdate::skipped("run cancelled"))
                        .await?;
                    return Ok(Flow::Cancelled);
                }
            }
        }
    }

    /// Fans branch subgraphs out concurrently and joins them under the
    /// node's policy. Each branch runs on a fork of the environment with
    /// the shared step counter; settled branches merge their bindings
    /// back in completion order. Every in-flight branch settles before
    /// the join decides, so no step is abandoned mid-write.
    async fn run_parallel(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        branches: &[Vec<NodeId>],
        join: JoinPolicy,
        resume: Option<ResumeToken>,
    ) -> Result<Flow, EngineError> {
        let (par_step, mut settled, seeded) = match resume {
            Some(mut token) => {
                let Some(Frame::Parallel {
                    node: frame_node,
                    step,
                    branch,
                    position,
                    settled,
                }) = token.frames.pop_front()
                else {
                    return Err(StateError::DecodeFailed {
                        reason: format!("suspension frames do not lead to node {}", node.id),
                    }
                    .into());
                };
                if frame_node != node.id {
                    return Err(StateError::NodeMissing { node_id: frame_node }.into());
                }
                if branch >= branches.len() {
                    return Err(StateError::DecodeFailed {
                        reason: format!("branch {branch} out of range for node {}", node.id),
                    }
                    .into());
                }
                // Settle the gated branch on the parent context first;
                // its pre-gate bindings are already in the checkpoint.
                match self
                    .run_body(ctx, node.id, &branches[branch], position, Some(token))
                    .await?
                {
                    BodyFlow::Suspended { mut suspension, at } => {
                        suspension.frames.insert(
                            0,
                            Frame::Parallel {
                                node: node.id,
                                step,
                                branch,
                                position: at,
                                settled,
                            },
                        );
                        self.repository
                            .update_step(step, StepUpdate::suspended())
                            .await?;
                        return Ok(Flow::Suspend(suspension));
                    }
                    BodyFlow::Cancelled => {
                        self.repository
                            .update_step(step, StepUpdate::skipped("run cancelled"))
                            .await?;
                        return Ok(Flow::Cancelled);
                    }
                    other => (step, settled, Some((branch, other))),
                }
            }
            None => {
                let step = self.append_step(ctx, node, StepStatus::Running, None).await?;
                (step, Vec::new(), None)
            }
        };

        // Outcomes in completion order; a just-settled gated branch
        // comes first.
        let mut outcomes: Vec<(usize, BodyFlow)> = Vec::new();
        if let Some(outcome) = seeded {
            outcomes.push(outcome);
        }

        let mut arrivals = Vec::new();
        {
            let parent: &RunCtx<'_> = ctx;
            let owner = node.id;
            let mut in_flight = FuturesUnordered::new();
            for (index, members) in branches.iter().enumerate() {
                if settled.contains(&index) || outcomes.iter().any(|(done, _)| *done == index) {
                    continue;
                }
                in_flight.push(async move {
                    let mut fork = parent.fork();
                    let flow = self.run_body(&mut fork, owner, members, 0, None).await;
                    (index, flow, fork.environment)
                });
            }
            while let Some(arrival) = in_flight.next().await {
                arrivals.push(arrival);
            }
        }
        let mut environments: Vec<(usize, JsonValue)> = Vec::new();
        for (index, flow, environment) in arrivals {
            outcomes.push((index, flow?));
            environments.push((index, environment));
        }

        let mut completed: Vec<usize> = Vec::new();
        let mut gates: Vec<(usize, Suspension, usize)> = Vec::new();
        let mut fault: Option<ExecutionError> = None;
        let mut cancelled = false;
        for (index, flow) in outcomes {
            match flow {
                BodyFlow::Completed => {
                    completed.push(index);
                    settled.push(index);
                    if let Some(found) = environments.iter().position(|(i, _)| *i == index) {
                        let (_, environment) = environments.swap_remove(found);
                        merge_environment(&mut ctx.environment, &environment);
                    }
                }
                BodyFlow::Suspended { suspension, at } => gates.push((index, suspension, at)),
                BodyFlow::Fault(err) => {
                    if fault.is_none() {
                        fault = Some(err);
                    }
                    // A tolerated failure needs no re-run on resume.
                    if join != JoinPolicy::AllSucceeded {
                        settled.push(index);
                    }
                }
                BodyFlow::Cancelled => cancelled = true,
            }
        }

        if cancelled {
            self.skip_gates(gates, "run cancelled").await?;
            self.repository
                .update_step(par_step, StepUpdate::skipped("run cancelled"))
                .await?;
            return Ok(Flow::Cancelled);
        }

        match join {
            JoinPolicy::FirstCompleted => {
                if let Some(&winner) = completed.first() {
                    self.skip_gates(gates, "another branch completed first")
                        .await?;
                    self.repository
                        .update_step(
                            par_step,
                            StepUpdate::completed(Some(json!({ "winner": winner }))),
                        )
                        .await?;
                    return Ok(Flow::Next);
                }
                if !gates.is_empty() {
                    return self
                        .suspend_parallel(ctx, node.id, par_step, gates, settled, &environments)
                        .await;
                }
                let err = ExecutionError::AllBranchesFailed { node_id: node.id };
                self.repository
                    .update_step(par_step, StepUpdate::failed(err.to_string()))
                    .await?;
                Ok(Flow::Fault(err))
            }
            JoinPolicy::AllSucceeded => {
                if let Some(err) = fault {
                    self.skip_gates(gates, "sibling branch failed").await?;
                    self.repository
                        .update_step(par_step, StepUpdate::failed(err.to_string()))
                        .await?;
                    return Ok(Flow::Fault(err));
                }
                if !gates.is_empty() {
                    return self
                        .suspend_parallel(ctx, node.id, par_step, gates, settled, &environments)
                        .await;
                }
                self.repository
                    .update_step(
                        par_step,
                        StepUpdate::completed(Some(json!({ "branches": branches.len() }))),
                    )
                    .await?;
                Ok(Flow::Next)
            }
            JoinPolicy::AllCompleted => {
                if !gates.is_empty() {
                    return self
                        .suspend_parallel(ctx, node.id, par_step, gates, settled, &environments)
                        .await;
                }
                self.repository
                    .update_step(
                        par_step,
                        StepUpdate::completed(Some(json!({ "branches": branches.len() }))),
                    )
                    .await?;
                Ok(Flow::Next)
            }
        }
    }

    /// Checkpoints the first gate to arrive. Later gates re-run after
    /// resume, so their pending steps are closed out now.
    async fn suspend_parallel(
        &self,
        ctx: &mut RunCtx<'_>,
        node_id: NodeId,
        par_step: WorkflowStepId,
        mut gates: Vec<(usize, Suspension, usize)>,
        settled: Vec<usize>,
        environments: &[(usize, JsonValue)],
    ) -> Result<Flow, EngineError> {
        let (branch, mut suspension, position) = gates.remove(0);
        self.skip_gates(gates, "re-gated after concurrent suspension")
            .await?;
        // Pre-gate bindings of the suspended branch must survive into
        // the checkpoint for templates past the gate.
        if let Some((_, environment)) = environments.iter().find(|(i, _)| *i == branch) {
            merge_environment(&mut ctx.environment, environment);
        }
        suspension.frames.insert(
            0,
            Frame::Parallel {
                node: node_id,
                step: par_step,
                branch,
                position,
                settled,
            },
        );
        self.repository
            .update_step(par_step, StepUpdate::suspended())
            .await?;
        Ok(Flow::Suspend(suspension))
    }

    async fn skip_gates(
        &self,
        gates: Vec<(usize, Suspension, usize)>,
        reason: &str,
    ) -> Result<(), EngineError> {
        for (_, gate, _) in gates {
            self.repository
                .update_step(gate.pending_step, StepUpdate::skipped(reason))
                .await?;
        }
        Ok(())
    }

    /// Runs a body sequence. Boxed because loop/parallel bodies may nest.
    fn run_body<'a, 'b>(
        &'a self,
        ctx: &'a mut RunCtx<'b>,
        owner: NodeId,
        nodes: &'a [NodeId],
        start: usize,
        mut resume: Option<ResumeToken>,
    ) -> BoxFuture<'a, Result<BodyFlow, EngineError>>
    where
        'b: 'a,
    {
        Box::pin(async move {
            let mut index = start;
            while index < nodes.len() {
                if self.repository.is_cancel_requested(ctx.run_id).await? {
                    return Ok(BodyFlow::Cancelled);
                }
                match self.dispatch(ctx, nodes[index], resume.take()).await? {
                    Flow::Next => index += 1,
                    Flow::Suspend(suspension) => {
                        return Ok(BodyFlow::Suspended {
                            suspension,
                            at: index,
                        });
                    }
                    Flow::Fault(err) => return Ok(BodyFlow::Fault(err)),
                    Flow::Cancelled => return Ok(BodyFlow::Cancelled),
                    Flow::Goto(_) | Flow::Output(_) => {
                        return Err(GraphError::InvalidBodyNode {
                            node_id: owner,
                            member: nodes[index],
                        }
                        .into());
                    }
                }
            }
            Ok(BodyFlow::Completed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;
    use crate::graph::{Edge, WorkflowGraph};
    use crate::node::ConditionBranch;
    use crate::repository::InMemoryRunRepository;
    use crate::run::StepStatus;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use nimbus_ai::{FailingBackend, ModelResponse, ScriptedBackend};
    use nimbus_core::WorkflowId;
    use nimbus_tooling::{ApprovalLevel, EchoTool, FailingTool, RiskLevel, StaticTool, Tool, ToolError};
    use std::time::Duration;

    /// A tool that waits before echoing, for completion-order tests.
    struct SleepyTool {
        name: String,
        delay: Duration,
    }

    #[async_trait]
    impl Tool for SleepyTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "waits, then echoes its arguments"
        }

        fn approval_level(&self) -> ApprovalLevel {
            ApprovalLevel::Auto
        }

        async fn invoke(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
            tokio::time::sleep(self.delay).await;
            Ok(args)
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(
            ToolRegistry::builder()
                .register(Arc::new(EchoTool::new("list_instances", ApprovalLevel::Auto)))
                .register(Arc::new(EchoTool::new(
                    "resize_instance",
                    ApprovalLevel::Confirm,
                )))
                .register(Arc::new(EchoTool::new(
                    "terminate_instance",
                    ApprovalLevel::Danger,
                )))
                .register(Arc::new(FailingTool::new(
                    "flaky_restart",
                    ApprovalLevel::Auto,
                    "api quota exceeded",
                )))
                .register(Arc::new(StaticTool::new(
                    "health_check",
                    ApprovalLevel::Auto,
                    json!({"healthy": true}),
                )))
                .register(Arc::new(SleepyTool {
                    name: "slow_listing".to_string(),
                    delay: Duration::from_millis(50),
                }))
                .build(),
        )
    }

    struct Harness {
        repository: Arc<InMemoryRunRepository>,
        executor: WorkflowExecutor,
    }

    fn harness_with(threshold: RiskLevel, responses: Vec<ModelResponse>) -> Harness {
        let repository = Arc::new(InMemoryRunRepository::new());
        let executor = WorkflowExecutor::new(
            repository.clone(),
            registry(),
            ApprovalPolicy::new(threshold),
            Arc::new(ScriptedBackend::new(responses)),
        );
        Harness {
            repository,
            executor,
        }
    }

    fn harness() -> Harness {
        harness_with(RiskLevel::Medium, vec![])
    }

    fn tool_node(name: &str, tool: &str) -> Node {
        Node::new(
            name,
            NodeKind::Tool {
                tool_name: tool.to_string(),
                arguments: json!({"instance_id": "{{input.instance_id}}"}),
            },
        )
    }

    /// input -> one tool node named "action" -> output {"result": result}.
    fn tool_chain(tool: &str) -> WorkflowDefinition {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(Node::new("start", NodeKind::Input));
        let b = graph.add_node(tool_node("action", tool));
        let c = graph.add_node(Node::new(
            "end",
            NodeKind::Output {
                mapping: json!({"result": "{{action}}"}),
            },
        ));
        graph.add_edge(Edge::new(a, b)).unwrap();
        graph.add_edge(Edge::new(b, c)).unwrap();
        WorkflowDefinition::new(format!("run {tool}"), graph)
    }

    async fn start(
        h: &Harness,
        definition: &WorkflowDefinition,
        input: JsonValue,
    ) -> (WorkflowRunId, ExecutionResult) {
        let run = WorkflowRun::new(definition.id, definition.version, input);
        let run_id = run.id;
        let result = h.executor.start(definition, run).await.unwrap();
        (run_id, result)
    }

    async fn resume_with(
        h: &Harness,
        definition: &WorkflowDefinition,
        run_id: WorkflowRunId,
        decision: Option<ApprovalDecision>,
    ) -> ExecutionResult {
        let run = h.repository.get_run(run_id).await.unwrap();
        let state = EngineState::decode(run.engine_state.clone().unwrap()).unwrap();
        h.executor
            .resume(definition, &run, state, decision)
            .await
            .unwrap()
    }

    fn assert_strictly_increasing(steps: &[WorkflowStep]) {
        for pair in steps.windows(2) {
            assert!(
                pair[0].step_number < pair[1].step_number,
                "step numbers not strictly increasing: {} then {}",
                pair[0].step_number,
                pair[1].step_number
            );
        }
    }

    #[tokio::test]
    async fn auto_tool_completes_without_suspension() {
        let h = harness();
        let definition = tool_chain("list_instances");
        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-1"})).await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!({"result": {"instance_id": "i-1"}})));

        let run = h.repository.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.engine_state.is_none());

        let steps = h.repository.list_steps(run_id).await.unwrap();
        let kinds: Vec<&str> = steps.iter().map(|s| s.node_kind.as_str()).collect();
        assert_eq!(kinds, vec!["input", "tool", "output"]);
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(
            steps.iter().map(|s| s.step_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn gated_tool_suspends_before_running() {
        let h = harness();
        let definition = tool_chain("terminate_instance");
        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-9"})).await;

        assert_eq!(result.status, RunStatus::Suspended);
        let state = result.engine_state.unwrap();
        assert!(state.frames.is_empty());

        let run = h.repository.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Suspended);
        assert!(run.engine_state.is_some());

        // The tool step is recorded before the tool runs: resolved args
        // captured, no output yet.
        let steps = h.repository.list_steps(run_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].status, StepStatus::Suspended);
        assert_eq!(steps[1].input, Some(json!({"instance_id": "i-9"})));
        assert!(steps[1].output.is_none());
    }

    #[tokio::test]
    async fn approval_completes_the_suspended_run() {
        let h = harness();
        let definition = tool_chain("terminate_instance");
        let (run_id, _) = start(&h, &definition, json!({"instance_id": "i-9"})).await;

        let result =
            resume_with(&h, &definition, run_id, Some(ApprovalDecision::approved())).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!({"result": {"instance_id": "i-9"}})));

        let steps = h.repository.list_steps(run_id).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].status, StepStatus::Completed);
        assert_strictly_increasing(&steps);
    }

    #[tokio::test]
    async fn rejection_skips_the_step_and_fails_the_run() {
        let h = harness();
        let definition = tool_chain("terminate_instance");
        let (run_id, _) = start(&h, &definition, json!({"instance_id": "i-9"})).await;

        let result = resume_with(
            &h,
            &definition,
            run_id,
            Some(ApprovalDecision::rejected("wrong environment")),
        )
        .await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("rejected by approver"));

        let run = h.repository.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("rejected by approver"));
        assert!(run.engine_state.is_none());

        let steps = h.repository.list_steps(run_id).await.unwrap();
        assert_eq!(steps[1].status, StepStatus::Skipped);
        assert_eq!(steps[1].error.as_deref(), Some("rejected by approver"));
    }

    #[tokio::test]
    async fn resume_without_decision_resuspends_unchanged() {
        let h = harness();
        let definition = tool_chain("terminate_instance");
        let (run_id, first) = start(&h, &definition, json!({"instance_id": "i-9"})).await;
        let before = first.engine_state.unwrap();

        let result = resume_with(&h, &definition, run_id, None).await;
        assert_eq!(result.status, RunStatus::Suspended);
        assert_eq!(result.engine_state, Some(before));

        let run = h.repository.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Suspended);
    }

    #[tokio::test]
    async fn high_threshold_lets_confirm_tools_run() {
        let h = harness_with(RiskLevel::High, vec![]);
        let definition = tool_chain("resize_instance");
        let (_, result) = start(&h, &definition, json!({"instance_id": "i-2"})).await;
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn low_threshold_gates_read_only_tools() {
        let h = harness_with(RiskLevel::Low, vec![]);
        let definition = tool_chain("list_instances");
        let (_, result) = start(&h, &definition, json!({"instance_id": "i-3"})).await;
        assert_eq!(result.status, RunStatus::Suspended);
    }

    #[tokio::test]
    async fn unknown_tool_is_gated_even_at_high_threshold() {
        let h = harness_with(RiskLevel::High, vec![]);
        let definition = tool_chain("not_registered");
        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-4"})).await;
        assert_eq!(result.status, RunStatus::Suspended);

        // Approving still fails the run: the catalog has no such tool.
        let result =
            resume_with(&h, &definition, run_id, Some(ApprovalDecision::approved())).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("not_registered"));
    }

    #[tokio::test]
    async fn tool_failure_fails_the_run_without_an_engine_error() {
        let h = harness();
        let definition = tool_chain("flaky_restart");
        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-5"})).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("api quota exceeded"));

        let steps = h.repository.list_steps(run_id).await.unwrap();
        assert_eq!(steps[1].status, StepStatus::Failed);
    }

    fn routed_definition() -> WorkflowDefinition {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(Node::new("start", NodeKind::Input));
        let cond = graph.add_node(Node::new(
            "route",
            NodeKind::Condition {
                branches: vec![
                    ConditionBranch::new(
                        "big",
                        Predicate::GreaterThan {
                            path: "input.count".into(),
                            value: 10.0,
                        },
                    ),
                    ConditionBranch::new(
                        "small",
                        Predicate::Exists {
                            path: "input.count".into(),
                        },
                    ),
                ],
            },
        ));
        let big = graph.add_node(Node::new(
            "big_end",
            NodeKind::Output {
                mapping: json!({"route": "big"}),
            },
        ));
        let small = graph.add_node(Node::new(
            "small_end",
            NodeKind::Output {
                mapping: json!({"route": "small"}),
            },
        ));
        graph.add_edge(Edge::new(a, cond)).unwrap();
        graph.add_edge(Edge::labeled(cond, big, "big")).unwrap();
        graph.add_edge(Edge::labeled(cond, small, "small")).unwrap();
        WorkflowDefinition::new("routed", graph)
    }

    #[tokio::test]
    async fn condition_takes_first_matching_branch() {
        let h = harness();
        let definition = routed_definition();

        let (_, result) = start(&h, &definition, json!({"count": 42})).await;
        assert_eq!(result.output, Some(json!({"route": "big"})));

        let (_, result) = start(&h, &definition, json!({"count": 3})).await;
        assert_eq!(result.output, Some(json!({"route": "small"})));
    }

    #[tokio::test]
    async fn condition_without_match_fails_the_run() {
        let h = harness();
        let definition = routed_definition();
        // No `count` at all: neither branch holds.
        let (run_id, result) = start(&h, &definition, json!({})).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("no condition branch matched"));

        let steps = h.repository.list_steps(run_id).await.unwrap();
        assert_eq!(steps[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn goto_target_without_successor_fails_as_no_output() {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(Node::new("start", NodeKind::Input));
        let cond = graph.add_node(Node::new(
            "route",
            NodeKind::Condition {
                branches: vec![
                    ConditionBranch::new(
                        "act",
                        Predicate::Truthy {
                            path: "input.act".into(),
                        },
                    ),
                    ConditionBranch::new(
                        "skip",
                        Predicate::Exists {
                            path: "input".into(),
                        },
                    ),
                ],
            },
        ));
        // Dead-end branch: the tool has no outgoing edge.
        let dead = graph.add_node(Node::new(
            "probe",
            NodeKind::Tool {
                tool_name: "list_instances".to_string(),
                arguments: json!({}),
            },
        ));
        let out = graph.add_node(Node::new("end", NodeKind::Output { mapping: json!({}) }));
        graph.add_edge(Edge::new(a, cond)).unwrap();
        graph.add_edge(Edge::labeled(cond, dead, "act")).unwrap();
        graph.add_edge(Edge::labeled(cond, out, "skip")).unwrap();
        let definition = WorkflowDefinition::new("dead end", graph);

        let h = harness();
        let (_, result) = start(&h, &definition, json!({"act": true})).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("without reaching an output"));
    }

    fn loop_definition(
        body_node: Node,
        until: Predicate,
        max_iterations: Option<u32>,
        mapping: JsonValue,
    ) -> WorkflowDefinition {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(Node::new("start", NodeKind::Input));
        let body = graph.add_node(body_node);
        let lp = graph.add_node(Node::new(
            "wait",
            NodeKind::Loop {
                body: vec![body],
                until,
                max_iterations,
            },
        ));
        let z = graph.add_node(Node::new("end", NodeKind::Output { mapping }));
        graph.add_edge(Edge::new(a, lp)).unwrap();
        graph.add_edge(Edge::new(lp, z)).unwrap();
        WorkflowDefinition::new("looped", graph)
    }

    #[tokio::test]
    async fn loop_runs_until_predicate_holds() {
        let responses = vec![
            ModelResponse::text("pending", "scripted"),
            ModelResponse::text("pending", "scripted"),
            ModelResponse::text("done", "scripted"),
        ];
        let h = harness_with(RiskLevel::Medium, responses);
        let definition = loop_definition(
            Node::new(
                "poll",
                NodeKind::AiStep {
                    prompt: "What is the deployment status?".to_string(),
                    bind_to: "status".to_string(),
                },
            ),
            Predicate::Equals {
                path: "status".into(),
                value: json!("done"),
            },
            Some(10),
            json!({"final": "{{status}}"}),
        );

        let (run_id, result) = start(&h, &definition, json!({})).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!({"final": "done"})));

        let steps = h.repository.list_steps(run_id).await.unwrap();
        let polls = steps.iter().filter(|s| s.node_kind == "ai_step").count();
        assert_eq!(polls, 3);
        let loop_step = steps.iter().find(|s| s.node_kind == "loop").unwrap();
        assert_eq!(loop_step.status, StepStatus::Completed);
        assert_eq!(loop_step.output, Some(json!({"iterations": 3})));
    }

    #[tokio::test]
    async fn loop_cap_fails_after_exactly_that_many_iterations() {
        let h = harness();
        let definition = loop_definition(
            Node::new(
                "probe",
                NodeKind::Tool {
                    tool_name: "health_check".to_string(),
                    arguments: json!({}),
                },
            ),
            Predicate::Exists {
                path: "never_bound".into(),
            },
            Some(100),
            json!({}),
        );

        let (run_id, result) = start(&h, &definition, json!({})).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("100"));

        let steps = h.repository.list_steps(run_id).await.unwrap();
        let probes = steps.iter().filter(|s| s.node_kind == "tool").count();
        assert_eq!(probes, 100, "cap means exactly that many body passes");
        let loop_step = steps.iter().find(|s| s.node_kind == "loop").unwrap();
        assert_eq!(loop_step.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn suspension_inside_a_loop_resumes_mid_iteration() {
        let h = harness();
        let definition = loop_definition(
            tool_node("action", "terminate_instance"),
            Predicate::Exists {
                path: "action".into(),
            },
            Some(5),
            json!({"result": "{{action}}"}),
        );

        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-6"})).await;
        assert_eq!(result.status, RunStatus::Suspended);
        let state = result.engine_state.unwrap();
        assert_eq!(state.frames.len(), 1);

        let result =
            resume_with(&h, &definition, run_id, Some(ApprovalDecision::approved())).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!({"result": {"instance_id": "i-6"}})));

        let steps = h.repository.list_steps(run_id).await.unwrap();
        assert_strictly_increasing(&steps);
        let loop_step = steps.iter().find(|s| s.node_kind == "loop").unwrap();
        assert_eq!(loop_step.status, StepStatus::Completed);
        assert_eq!(loop_step.output, Some(json!({"iterations": 1})));
    }

    fn parallel_definition(
        branches: Vec<Vec<Node>>,
        join: JoinPolicy,
        mapping: JsonValue,
    ) -> WorkflowDefinition {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(Node::new("start", NodeKind::Input));
        let branch_ids: Vec<Vec<NodeId>> = branches
            .into_iter()
            .map(|branch| branch.into_iter().map(|n| graph.add_node(n)).collect())
            .collect();
        let par = graph.add_node(Node::new(
            "fan_out",
            NodeKind::Parallel {
                branches: branch_ids,
                join,
            },
        ));
        let z = graph.add_node(Node::new("end", NodeKind::Output { mapping }));
        graph.add_edge(Edge::new(a, par)).unwrap();
        graph.add_edge(Edge::new(par, z)).unwrap();
        WorkflowDefinition::new("fanned", graph)
    }

    #[tokio::test]
    async fn parallel_all_succeeded_runs_every_branch() {
        let h = harness();
        let definition = parallel_definition(
            vec![
                vec![tool_node("listing", "list_instances")],
                vec![tool_node("health", "health_check")],
            ],
            JoinPolicy::AllSucceeded,
            json!({"listing": "{{listing}}", "health": "{{health}}"}),
        );

        let (_, result) = start(&h, &definition, json!({"instance_id": "i-7"})).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            result.output,
            Some(json!({
                "listing": {"instance_id": "i-7"},
                "health": {"healthy": true},
            }))
        );
    }

    #[tokio::test]
    async fn parallel_all_succeeded_fails_on_any_branch_failure() {
        let h = harness();
        let definition = parallel_definition(
            vec![
                vec![tool_node("broken", "flaky_restart")],
                vec![tool_node("listing", "list_instances")],
            ],
            JoinPolicy::AllSucceeded,
            json!({}),
        );

        let (_, result) = start(&h, &definition, json!({"instance_id": "i-7"})).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("api quota exceeded"));
    }

    #[tokio::test]
    async fn parallel_all_completed_tolerates_branch_failure() {
        let h = harness();
        let definition = parallel_definition(
            vec![
                vec![tool_node("broken", "flaky_restart")],
                vec![tool_node("health", "health_check")],
            ],
            JoinPolicy::AllCompleted,
            json!({"health": "{{health}}"}),
        );

        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-7"})).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!({"health": {"healthy": true}})));

        let steps = h.repository.list_steps(run_id).await.unwrap();
        let par_step = steps.iter().find(|s| s.node_kind == "parallel").unwrap();
        assert_eq!(par_step.status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn parallel_first_completed_reports_the_winner() {
        let h = harness();
        let definition = parallel_definition(
            vec![
                vec![tool_node("broken", "flaky_restart")],
                vec![tool_node("health", "health_check")],
                vec![tool_node("listing", "slow_listing")],
            ],
            JoinPolicy::FirstCompleted,
            json!({"health": "{{health}}"}),
        );

        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-7"})).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!({"health": {"healthy": true}})));

        // Every branch ran; branch 0 faulted, branch 1 finished first.
        let steps = h.repository.list_steps(run_id).await.unwrap();
        let tools = steps.iter().filter(|s| s.node_kind == "tool").count();
        assert_eq!(tools, 3);
        let par_step = steps.iter().find(|s| s.node_kind == "parallel").unwrap();
        assert_eq!(par_step.output, Some(json!({"winner": 1})));
        assert_strictly_increasing(&steps);
    }

    #[tokio::test]
    async fn parallel_first_completed_picks_the_fastest_branch() {
        let h = harness();
        let definition = parallel_definition(
            vec![
                vec![tool_node("listing", "slow_listing")],
                vec![tool_node("health", "health_check")],
            ],
            JoinPolicy::FirstCompleted,
            json!({"health": "{{health}}"}),
        );

        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-7"})).await;
        assert_eq!(result.status, RunStatus::Completed);

        // Declaration order does not decide the winner; arrival order does.
        let steps = h.repository.list_steps(run_id).await.unwrap();
        let par_step = steps.iter().find(|s| s.node_kind == "parallel").unwrap();
        assert_eq!(par_step.output, Some(json!({"winner": 1})));
        let tools: Vec<_> = steps.iter().filter(|s| s.node_kind == "tool").collect();
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn parallel_gate_resumes_without_rerunning_settled_branches() {
        let h = harness();
        let definition = parallel_definition(
            vec![
                vec![tool_node("action", "terminate_instance")],
                vec![tool_node("health", "health_check")],
            ],
            JoinPolicy::AllSucceeded,
            json!({"action": "{{action}}", "health": "{{health}}"}),
        );

        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-9"})).await;
        assert_eq!(result.status, RunStatus::Suspended);
        let state = result.engine_state.unwrap();
        assert!(matches!(
            &state.frames[0],
            Frame::Parallel { branch: 0, settled, .. } if settled == &vec![1]
        ));

        let result =
            resume_with(&h, &definition, run_id, Some(ApprovalDecision::approved())).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            result.output,
            Some(json!({
                "action": {"instance_id": "i-9"},
                "health": {"healthy": true},
            }))
        );

        // The completed sibling was not re-driven on resume.
        let steps = h.repository.list_steps(run_id).await.unwrap();
        let tools = steps.iter().filter(|s| s.node_kind == "tool").count();
        assert_eq!(tools, 2);
        let par_step = steps.iter().find(|s| s.node_kind == "parallel").unwrap();
        assert_eq!(par_step.status, StepStatus::Completed);
        assert_strictly_increasing(&steps);
    }

    #[tokio::test]
    async fn parallel_first_completed_with_all_failures_fails() {
        let h = harness();
        let definition = parallel_definition(
            vec![vec![tool_node("broken", "flaky_restart")]],
            JoinPolicy::FirstCompleted,
            json!({}),
        );

        let (_, result) = start(&h, &definition, json!({"instance_id": "i-7"})).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("all parallel branches failed"));
    }

    /// input -> approval gate -> health_check -> output {"health": health}.
    fn maintenance_gate_definition() -> WorkflowDefinition {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(Node::new("start", NodeKind::Input));
        let gate = graph.add_node(Node::new(
            "gate",
            NodeKind::Approval {
                message: "Proceed with the maintenance window?".to_string(),
            },
        ));
        let check = graph.add_node(Node::new(
            "health",
            NodeKind::Tool {
                tool_name: "health_check".to_string(),
                arguments: json!({}),
            },
        ));
        let z = graph.add_node(Node::new(
            "end",
            NodeKind::Output {
                mapping: json!({"health": "{{health}}"}),
            },
        ));
        graph.add_edge(Edge::new(a, gate)).unwrap();
        graph.add_edge(Edge::new(gate, check)).unwrap();
        graph.add_edge(Edge::new(check, z)).unwrap();
        WorkflowDefinition::new("maintenance window", graph)
    }

    #[tokio::test]
    async fn approval_node_suspends_with_its_message() {
        let h = harness();
        let definition = maintenance_gate_definition();

        let (run_id, result) = start(&h, &definition, json!({})).await;
        assert_eq!(result.status, RunStatus::Suspended);

        let steps = h.repository.list_steps(run_id).await.unwrap();
        let gate_step = steps.iter().find(|s| s.node_kind == "approval").unwrap();
        assert_eq!(gate_step.status, StepStatus::Suspended);
        assert_eq!(
            gate_step.input,
            Some(json!({"message": "Proceed with the maintenance window?"}))
        );
        assert!(!steps.iter().any(|s| s.node_kind == "tool"));

        let run = h.repository.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Suspended);
        assert!(run.engine_state.is_some());
    }

    #[tokio::test]
    async fn approved_gate_node_continues_to_the_next_node() {
        let h = harness();
        let definition = maintenance_gate_definition();
        let (run_id, _) = start(&h, &definition, json!({})).await;

        let result =
            resume_with(&h, &definition, run_id, Some(ApprovalDecision::approved())).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!({"health": {"healthy": true}})));

        let steps = h.repository.list_steps(run_id).await.unwrap();
        let gate_step = steps.iter().find(|s| s.node_kind == "approval").unwrap();
        assert_eq!(gate_step.status, StepStatus::Completed);
        assert_strictly_increasing(&steps);
    }

    #[tokio::test]
    async fn rejected_gate_node_fails_the_run() {
        let h = harness();
        let definition = maintenance_gate_definition();
        let (run_id, _) = start(&h, &definition, json!({})).await;

        let result = resume_with(
            &h,
            &definition,
            run_id,
            Some(ApprovalDecision::rejected("not during business hours")),
        )
        .await;
        assert_eq!(result.status, RunStatus::Failed);

        let steps = h.repository.list_steps(run_id).await.unwrap();
        let gate_step = steps.iter().find(|s| s.node_kind == "approval").unwrap();
        assert_eq!(gate_step.status, StepStatus::Skipped);
        assert_eq!(gate_step.error.as_deref(), Some("rejected by approver"));
        assert!(!steps.iter().any(|s| s.node_kind == "tool"));
    }

    #[tokio::test]
    async fn approval_node_redrive_without_decision_stays_suspended() {
        let h = harness();
        let definition = maintenance_gate_definition();
        let (run_id, first) = start(&h, &definition, json!({})).await;

        let result = resume_with(&h, &definition, run_id, None).await;
        assert_eq!(result.status, RunStatus::Suspended);
        assert_eq!(result.engine_state, first.engine_state);

        let run = h.repository.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Suspended);
    }

    #[tokio::test]
    async fn ai_step_renders_prompt_and_binds_output() {
        let repository = Arc::new(InMemoryRunRepository::new());
        let backend = Arc::new(ScriptedBackend::new(vec![ModelResponse::text(
            "scale up the web tier",
            "scripted",
        )]));
        let executor = WorkflowExecutor::new(
            repository.clone(),
            registry(),
            ApprovalPolicy::default(),
            backend.clone(),
        );

        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(Node::new("start", NodeKind::Input));
        let ai = graph.add_node(Node::new(
            "advise",
            NodeKind::AiStep {
                prompt: "Recommend an action for {{input.alert}}".to_string(),
                bind_to: "advice".to_string(),
            },
        ));
        let z = graph.add_node(Node::new(
            "end",
            NodeKind::Output {
                mapping: json!({"advice": "{{advice}}"}),
            },
        ));
        graph.add_edge(Edge::new(a, ai)).unwrap();
        graph.add_edge(Edge::new(ai, z)).unwrap();
        let definition = WorkflowDefinition::new("advised", graph);

        let run = WorkflowRun::new(definition.id, definition.version, json!({"alert": "cpu"}));
        let result = executor.start(&definition, run).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            result.output,
            Some(json!({"advice": "scale up the web tier"}))
        );
        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "Recommend an action for cpu");
    }

    #[tokio::test]
    async fn ai_step_failure_fails_the_run() {
        let repository = Arc::new(InMemoryRunRepository::new());
        let executor = WorkflowExecutor::new(
            repository.clone(),
            registry(),
            ApprovalPolicy::default(),
            Arc::new(FailingBackend::new("model endpoint unreachable")),
        );

        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(Node::new("start", NodeKind::Input));
        let ai = graph.add_node(Node::new(
            "advise",
            NodeKind::AiStep {
                prompt: "Recommend an action".to_string(),
                bind_to: "advice".to_string(),
            },
        ));
        let z = graph.add_node(Node::new(
            "end",
            NodeKind::Output {
                mapping: json!({"advice": "{{advice}}"}),
            },
        ));
        graph.add_edge(Edge::new(a, ai)).unwrap();
        graph.add_edge(Edge::new(ai, z)).unwrap();
        let definition = WorkflowDefinition::new("advised", graph);

        let run = WorkflowRun::new(definition.id, definition.version, json!({}));
        let run_id = run.id;
        let result = executor.start(&definition, run).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("model endpoint unreachable"));

        let steps = repository.list_steps(run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_is_honored_before_any_node_runs() {
        let h = harness();
        let definition = tool_chain("list_instances");
        let run = WorkflowRun::new(definition.id, definition.version, json!({}));
        let run_id = run.id;
        h.repository.create_run(run.clone()).await.unwrap();
        h.repository.request_cancel(run_id).await.unwrap();

        let result = h.executor.execute(&definition, &run).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);

        let run = h.repository.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(h.repository.list_steps(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn version_mismatch_rejected_before_any_transition() {
        let h = harness();
        let definition = tool_chain("terminate_instance");
        let (run_id, result) = start(&h, &definition, json!({"instance_id": "i-8"})).await;
        let mut state = result.engine_state.unwrap();
        state.workflow_version += 1;

        let run = h.repository.get_run(run_id).await.unwrap();
        let err = h
            .executor
            .resume(&definition, &run, state, Some(ApprovalDecision::approved()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::VersionMismatch { .. })
        ));

        let run = h.repository.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Suspended);
        assert!(run.engine_state.is_some());
    }

    #[tokio::test]
    async fn gated_and_ungated_executions_agree_on_output() {
        let definition = tool_chain("terminate_instance");
        let input = json!({"instance_id": "i-10"});

        let gated = harness_with(RiskLevel::Medium, vec![]);
        let (run_id, first) = start(&gated, &definition, input.clone()).await;
        assert_eq!(first.status, RunStatus::Suspended);
        let approved = resume_with(
            &gated,
            &definition,
            run_id,
            Some(ApprovalDecision::approved()),
        )
        .await;

        let ungated = harness_with(RiskLevel::High, vec![]);
        let (_, direct) = start(&ungated, &definition, input).await;

        assert_eq!(approved.status, RunStatus::Completed);
        assert_eq!(direct.status, RunStatus::Completed);
        assert_eq!(approved.output, direct.output);
    }

    /// A repository that refuses every operation.
    struct UnavailableRepository;

    fn unavailable() -> RepositoryError {
        RepositoryError::Unavailable {
            reason: "database offline".to_string(),
        }
    }

    #[async_trait]
    impl RunRepository for UnavailableRepository {
        async fn create_run(&self, _run: WorkflowRun) -> Result<(), RepositoryError> {
            Err(unavailable())
        }
        async fn get_run(&self, _run_id: WorkflowRunId) -> Result<WorkflowRun, RepositoryError> {
            Err(unavailable())
        }
        async fn update_run_status(
            &self,
            _run_id: WorkflowRunId,
            _update: RunUpdate,
        ) -> Result<(), RepositoryError> {
            Err(unavailable())
        }
        async fn append_step(&self, _step: WorkflowStep) -> Result<(), RepositoryError> {
            Err(unavailable())
        }
        async fn update_step(
            &self,
            _step_id: WorkflowStepId,
            _update: StepUpdate,
        ) -> Result<(), RepositoryError> {
            Err(unavailable())
        }
        async fn list_steps(
            &self,
            _run_id: WorkflowRunId,
        ) -> Result<Vec<WorkflowStep>, RepositoryError> {
            Err(unavailable())
        }
        async fn list_stale(
            &self,
            _status: RunStatus,
            _older_than: DateTime<Utc>,
        ) -> Result<Vec<WorkflowRun>, RepositoryError> {
            Err(unavailable())
        }
        async fn claim_stale_run(
            &self,
            _run_id: WorkflowRunId,
            _older_than: DateTime<Utc>,
        ) -> Result<Option<WorkflowRun>, RepositoryError> {
            Err(unavailable())
        }
        async fn claim_suspended_run(
            &self,
            _run_id: WorkflowRunId,
        ) -> Result<bool, RepositoryError> {
            Err(unavailable())
        }
        async fn request_cancel(&self, _run_id: WorkflowRunId) -> Result<(), RepositoryError> {
            Err(unavailable())
        }
        async fn is_cancel_requested(
            &self,
            _run_id: WorkflowRunId,
        ) -> Result<bool, RepositoryError> {
            Err(unavailable())
        }
    }

    #[tokio::test]
    async fn repository_failures_are_reraised_not_swallowed() {
        let executor = WorkflowExecutor::new(
            Arc::new(UnavailableRepository),
            registry(),
            ApprovalPolicy::default(),
            Arc::new(ScriptedBackend::new(vec![])),
        );
        let definition = tool_chain("list_instances");
        let run = WorkflowRun::new(definition.id, definition.version, json!({}));

        let err = executor.execute(&definition, &run).await.unwrap_err();
        assert!(matches!(err, EngineError::Repository(_)));
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected_up_front() {
        let h = harness();
        let definition = WorkflowDefinition::new("empty", WorkflowGraph::new());
        let run = WorkflowRun::new(WorkflowId::new(), 1, json!({}));

        let err = h.executor.execute(&definition, &run).await.unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::NoEntryNode)));
    }
}
