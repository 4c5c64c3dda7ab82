//! Snapshot Store (C2): the durable per-run record.
//!
//! A narrow trait plus an in-memory and a Postgres-backed implementation,
//! both keyed by `(workflow id, run id)`, holding the full run ledger:
//! status, active paths, per-step results, and suspend/wait bookkeeping.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemorySnapshotStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresSnapshotStore;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use thiserror::Error;

use crate::error::EncodedError;

/// Errors raised by a [`SnapshotStore`].
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// No snapshot exists for the given workflow/run pair.
    #[error("no snapshot for workflow {wf_id} run {run_id}")]
    NotFound {
        /// Workflow id.
        wf_id: String,
        /// Run id.
        run_id: String,
    },
    /// The backing store rejected the write or read.
    #[error("snapshot store backend error: {0}")]
    Backend(String),
}

/// Terminal and non-terminal run statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The run is actively dispatching and has no outstanding waits.
    Running,
    /// All root-graph children reached success.
    Success,
    /// An unrecovered failure bubbled to the run's top level.
    Failed,
    /// At least one node is suspended awaiting resume.
    Suspended,
    /// `perStep` advanced exactly one node; call start/resume to continue.
    Paused,
    /// The run was canceled.
    Canceled,
    /// The run has nodes parked on a timer.
    Waiting,
}

impl Status {
    /// True for statuses that will never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failed | Status::Canceled)
    }
}

/// Status-tagged record of a single node's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Current status of this node.
    pub status: StepStatus,
    /// Epoch milliseconds when the node was first dispatched.
    pub started_at: i64,
    /// Epoch milliseconds when the node reached a terminal state, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// The input the node was invoked with.
    pub payload: Value,
    /// Output forwarded downstream, set once the node succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Encoded error, set once the node fails terminally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EncodedError>,
    /// Suspension payload, set while the node is suspended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_payload: Option<Value>,
    /// Epoch milliseconds when suspension was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<i64>,
    /// Data supplied when the node was resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_payload: Option<Value>,
    /// Epoch milliseconds when resume occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<i64>,
}

/// The status a [`StepResult`] can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Currently dispatched, no result yet.
    Running,
    /// Parked on a `sleep`/`sleep_until` timer.
    Waiting,
    /// Suspended awaiting resume.
    Suspended,
    /// Completed successfully.
    Success,
    /// Failed terminally (retries exhausted).
    Failed,
}

impl StepResult {
    /// A freshly dispatched step result.
    pub fn running(payload: Value, started_at: i64) -> Self {
        Self {
            status: StepStatus::Running,
            started_at,
            ended_at: None,
            payload,
            output: None,
            error: None,
            suspend_payload: None,
            suspended_at: None,
            resume_payload: None,
            resumed_at: None,
        }
    }

    /// Transition to success, recording the output and end time.
    pub fn succeed(mut self, output: Value, ended_at: i64) -> Self {
        self.status = StepStatus::Success;
        self.output = Some(output);
        self.ended_at = Some(ended_at);
        self
    }

    /// Transition to failed, recording the error and end time.
    pub fn fail(mut self, error: EncodedError, ended_at: i64) -> Self {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(ended_at);
        self
    }

    /// Transition to suspended, recording the suspension payload.
    pub fn suspend(mut self, payload: Value, suspended_at: i64) -> Self {
        self.status = StepStatus::Suspended;
        self.suspend_payload = Some(payload);
        self.suspended_at = Some(suspended_at);
        self
    }

    /// Mark a sleep node as parked on its timer; output mirrors payload.
    pub fn wait(mut self) -> Self {
        self.status = StepStatus::Waiting;
        self.output = Some(self.payload.clone());
        self
    }

    /// Record a resume: carries over `suspend_payload`, sets `resume_payload`
    /// and `resumed_at`.
    pub fn record_resume(mut self, resume_data: Value, resumed_at: i64) -> Self {
        self.resume_payload = Some(resume_data);
        self.resumed_at = Some(resumed_at);
        self
    }
}

/// The durable per-run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Committed workflow name this run belongs to.
    pub workflow_name: String,
    /// Unique run identity.
    pub run_id: String,
    /// Optional caller-supplied resource scoping id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Current run status.
    pub status: Status,
    /// Labels currently running, suspended, or waiting.
    pub active_paths: Vec<String>,
    /// Label to structural path-of-indices, for nested combinator addressing.
    /// Paths are a handful of indices deep in practice, so a `SmallVec`
    /// avoids a heap allocation per active node.
    pub active_steps_path: HashMap<String, SmallVec<[usize; 4]>>,
    /// The value currently flowing through the graph (last forwarded output).
    pub value: Value,
    /// Original run input plus a `StepResult` per label reached so far.
    pub context: RunContext,
    /// Structural fingerprint of the committed plan.
    pub serialized_step_graph: Value,
    /// Labels currently suspended, mapped to a resume cursor token.
    pub suspended_paths: HashMap<String, Value>,
    /// Labels currently parked on a timer, mapped to wake-at epoch ms.
    pub waiting_paths: HashMap<String, i64>,
    /// Label to resumption cursor, used by nested suspensions.
    pub resume_labels: HashMap<String, Value>,
    /// Per-label retry attempt counters.
    pub retry_count: HashMap<String, u32>,
    /// Last-update epoch milliseconds.
    pub timestamp: i64,
    /// Present iff `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EncodedError>,
    /// Monotonic sequence number of the last event applied; used for
    /// last-writer-wins across coordinators.
    pub last_sequence: u64,
}

/// Original run input plus the per-label execution ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    /// The run's original input data.
    pub input: Value,
    /// Per-label results, keyed by absolute label.
    pub steps: HashMap<String, StepResult>,
}

impl RunSnapshot {
    /// Build a fresh, running snapshot for a newly created run.
    pub fn new_running(
        workflow_name: impl Into<String>,
        run_id: impl Into<String>,
        resource_id: Option<String>,
        input: Value,
        serialized_step_graph: Value,
        timestamp: i64,
    ) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            run_id: run_id.into(),
            resource_id,
            status: Status::Running,
            active_paths: Vec::new(),
            active_steps_path: HashMap::new(),
            value: input.clone(),
            context: RunContext {
                input,
                steps: HashMap::new(),
            },
            serialized_step_graph,
            suspended_paths: HashMap::new(),
            waiting_paths: HashMap::new(),
            resume_labels: HashMap::new(),
            retry_count: HashMap::new(),
            timestamp,
            error: None,
            last_sequence: 0,
        }
    }
}

/// Filter applied by [`SnapshotStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to a specific resource id.
    pub resource_id: Option<String>,
    /// Restrict to runs with this status.
    pub status: Option<Status>,
    /// Maximum number of runs to return.
    pub limit: Option<usize>,
}

/// Snapshot Store contract (C2).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Idempotent write. Conflicts on an older `last_sequence` than the
    /// currently stored snapshot are silently ignored (last-writer-wins).
    async fn persist(&self, wf_id: &str, run_id: &str, snapshot: RunSnapshot) -> Result<(), SnapshotError>;

    /// Load a run's snapshot, if one exists.
    async fn load(&self, wf_id: &str, run_id: &str) -> Result<Option<RunSnapshot>, SnapshotError>;

    /// List runs for a workflow, returning the page and the total count.
    async fn list(&self, wf_id: &str, filter: ListFilter) -> Result<(Vec<RunSnapshot>, usize), SnapshotError>;

    /// Remove every snapshot for a workflow; test/dev utility only.
    async fn clear_all(&self, wf_id: &str) -> Result<(), SnapshotError>;
}
