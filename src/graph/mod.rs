//! Step Graph (C3): the immutable compiled plan of nodes.
//!
//! A tagged-variant node tree (step/parallel/branch/loop/foreach/sleep/map/
//! sub-workflow) built up through a mutable builder and frozen into a
//! [`Plan`] once committed.

pub mod builder;
pub mod schema;

pub use builder::{Plan, WorkflowBuilder};
pub use schema::Schema;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::EncodedError;
use crate::runtime::ExecutionContext;

/// Errors raised while building or validating a [`Plan`].
#[derive(Error, Debug)]
pub enum GraphError {
    /// A referenced step id has no registered [`Step`].
    #[error("step not found: {0}")]
    StepNotFound(String),
    /// A referenced sub-workflow id has no committed plan.
    #[error("sub-workflow not found: {0}")]
    SubWorkflowNotFound(String),
    /// The plan has no nodes.
    #[error("workflow plan is empty")]
    EmptyPlan,
    /// A removed combinator was used.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// A label could not be resolved against the committed graph.
    #[error("label not found in graph: {0}")]
    LabelNotFound(String),
}

/// The outcome of a single step invocation.
///
/// The engine never awaits user code holding coordinator state (design note
/// §9): rather than a true coroutine pause, `suspend`/`bail`/`abort` are
/// distinct return values the step function produces via
/// [`ExecutionContext`] helpers and then returns, e.g. `return
/// Ok(ctx.suspend(payload))`.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Normal completion; the value is forwarded downstream.
    Success(Value),
    /// The step suspended with the given payload.
    Suspend(Value),
    /// The step requested immediate run success with this output.
    Bail(Value),
    /// The step voluntarily aborted in response to a cancellation signal.
    Abort,
}

/// A user step's execute callable.
pub type StepFuture = BoxFuture<'static, std::result::Result<StepOutcome, EncodedError>>;

/// Boxed step function: takes an [`ExecutionContext`], returns a future.
pub type StepFn = Arc<dyn Fn(ExecutionContext) -> StepFuture + Send + Sync>;

/// Back-off policy applied between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retry attempts after the first (default 0).
    pub attempts: u32,
    /// Delay in milliseconds before each retry.
    pub delay_ms: u64,
    /// Optional multiplicative back-off applied per attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay_ms: 0,
            backoff_multiplier: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-based; attempt 0 never delays).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        if attempt == 0 {
            return std::time::Duration::ZERO;
        }
        let multiplier = self.backoff_multiplier.unwrap_or(1.0);
        let millis = (self.delay_ms as f64) * multiplier.powi((attempt - 1) as i32);
        std::time::Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Identity, schemas, and behavior of a single user step.
#[derive(Clone)]
pub struct Step {
    /// Stable string identity.
    pub id: String,
    /// Validator applied to the step's input, unless `validate_inputs` is off.
    pub input_schema: Schema,
    /// Validator applied to the step's output.
    pub output_schema: Schema,
    /// Validator applied to a suspension payload, if declared.
    pub suspend_schema: Option<Schema>,
    /// Validator applied to resume data, if declared.
    pub resume_schema: Option<Schema>,
    /// Step-level retry policy; overrides the workflow-level default.
    pub retry_policy: Option<RetryPolicy>,
    /// The callable invoked with the execution context.
    pub execute: StepFn,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Step {
    /// Produce a new, distinct step with the same behavior under a new id
    ///.
    pub fn clone_as(&self, new_id: impl Into<String>) -> Step {
        Step {
            id: new_id.into(),
            ..self.clone()
        }
    }
}

/// A single entry in a `branch` node: predicate plus the node to run when
/// the predicate is truthy.
#[derive(Clone)]
pub struct BranchArm {
    /// Label used to key this arm's output in the branch's result mapping.
    pub label: String,
    /// Async predicate evaluated against the incoming input.
    pub predicate: Arc<dyn Fn(Value) -> BoxFuture<'static, bool> + Send + Sync>,
    /// Node to schedule when the predicate is truthy.
    pub node: Box<GraphNode>,
}

impl fmt::Debug for BranchArm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchArm").field("label", &self.label).finish_non_exhaustive()
    }
}

/// A source a [`MapSpec`] resolves a named input from.
#[derive(Clone)]
pub enum MapSource {
    /// The run's original input, optionally narrowed by a dotted path.
    InitData {
        /// `"."` for the whole value, otherwise a dotted path.
        path: String,
    },
    /// A previously completed step's output, by label, optionally narrowed.
    StepRef {
        /// Candidate labels; the first with a terminal success result wins.
        refs: Vec<String>,
        /// `"."` for the whole output, otherwise a dotted path.
        path: String,
    },
    /// A value from the run's request context.
    RequestContextPath {
        /// Dotted path into the request context map.
        path: String,
    },
    /// A literal constant.
    Value(Value),
    /// A computed function over `(inputData, getStepResult)`.
    Fn(Arc<dyn Fn(&ExecutionContext) -> Value + Send + Sync>),
}

impl fmt::Debug for MapSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapSource::InitData { path } => f.debug_struct("InitData").field("path", path).finish(),
            MapSource::StepRef { refs, path } => f.debug_struct("StepRef").field("refs", refs).field("path", path).finish(),
            MapSource::RequestContextPath { path } => f.debug_struct("RequestContextPath").field("path", path).finish(),
            MapSource::Value(v) => f.debug_struct("Value").field("value", v).finish(),
            MapSource::Fn(_) => f.debug_struct("Fn").finish_non_exhaustive(),
        }
    }
}

/// A mapping spec: named keys in the synthesized object, each resolved from
/// a [`MapSource`].
#[derive(Debug, Clone, Default)]
pub struct MapSpec {
    /// Key to resolver, evaluated lazily during the run.
    pub fields: HashMap<String, MapSource>,
}

/// Options for a `foreach` node.
#[derive(Debug, Clone)]
pub struct ForeachOptions {
    /// Bounded concurrency for item dispatch (default 1).
    pub concurrency: usize,
}

impl Default for ForeachOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Tagged variant over the graph's node kinds.
#[derive(Debug, Clone)]
pub enum GraphNode {
    /// Invoke a single registered step.
    Step {
        /// Absolute label for this node.
        label: String,
        /// The step id to invoke.
        step_id: String,
    },
    /// Run every child concurrently; outputs keyed by child label.
    Parallel {
        /// Absolute label of this node.
        label: String,
        /// Children, in builder-call order (used by `perStep`).
        children: Vec<GraphNode>,
    },
    /// Evaluate every predicate concurrently; run the matching subset.
    Branch {
        /// Absolute label of this node.
        label: String,
        /// Arms, in builder-call order.
        arms: Vec<BranchArm>,
    },
    /// Repeat the inner node until the predicate holds on its last output.
    DoUntil {
        /// Absolute label of this node.
        label: String,
        /// Inner node to repeat.
        node: Box<GraphNode>,
        /// Stop condition; evaluated after each iteration.
        predicate: Arc<dyn Fn(Value) -> BoxFuture<'static, bool> + Send + Sync>,
    },
    /// Repeat the inner node while the predicate holds on its last output.
    DoWhile {
        /// Absolute label of this node.
        label: String,
        /// Inner node to repeat.
        node: Box<GraphNode>,
        /// Continue condition; evaluated after each iteration.
        predicate: Arc<dyn Fn(Value) -> BoxFuture<'static, bool> + Send + Sync>,
    },
    /// Apply the inner node to each element of an input sequence.
    Foreach {
        /// Absolute label of this node.
        label: String,
        /// Inner node applied per element.
        node: Box<GraphNode>,
        /// Bounded concurrency and other options.
        options: ForeachOptions,
    },
    /// Passthrough for `delay_ms` milliseconds.
    Sleep {
        /// Absolute label of this node.
        label: String,
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Passthrough until an absolute epoch-millisecond timestamp.
    SleepUntil {
        /// Absolute label of this node.
        label: String,
        /// Absolute wakeup time, epoch milliseconds.
        wake_at: i64,
    },
    /// Resolve a mapping spec to synthesize the next node's input.
    Map {
        /// Absolute label of this node.
        label: String,
        /// The resolver tree.
        spec: MapSpec,
    },
    /// Embed another committed plan as a single node.
    SubWorkflow {
        /// Absolute label of this node.
        label: String,
        /// Registry id of the committed sub-plan.
        workflow_id: String,
    },
}

impl GraphNode {
    /// The absolute label of this node.
    pub fn label(&self) -> &str {
        match self {
            GraphNode::Step { label, .. }
            | GraphNode::Parallel { label, .. }
            | GraphNode::Branch { label, .. }
            | GraphNode::DoUntil { label, .. }
            | GraphNode::DoWhile { label, .. }
            | GraphNode::Foreach { label, .. }
            | GraphNode::Sleep { label, .. }
            | GraphNode::SleepUntil { label, .. }
            | GraphNode::Map { label, .. }
            | GraphNode::SubWorkflow { label, .. } => label,
        }
    }
}
