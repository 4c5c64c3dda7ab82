//! Event Bus (C1): typed pub/sub over per-run and per-workflow topics.
//!
//! Topics are named `run:{id}:…` / `workflow:{wfId}:…`, events carry a
//! per-run monotonic sequence number, and a subscriber never observes the
//! same `(run_id, sequence)` pair twice.

mod memory;

pub use memory::InMemoryBus;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// The named topic has no registered subscribers at all (not itself
    /// fatal for publication, but surfaced so callers can detect dead runs).
    #[error("no subscribers for topic {0}")]
    NoSubscribers(String),

    /// A subscriber channel was dropped without being explicitly closed.
    #[error("subscriber channel closed for topic {0}")]
    SubscriberClosed(String),
}

/// A topic identifier. Topics are scoped either to a run (`run:{id}:{kind}`)
/// or globally to a workflow (`workflow:{wfId}:{kind}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(pub String);

impl Topic {
    /// Build a run-scoped topic.
    pub fn run(run_id: &str, kind: &str) -> Self {
        Self(format!("run:{run_id}:{kind}"))
    }

    /// Build a workflow-scoped (global) topic.
    pub fn workflow(wf_id: &str, kind: &str) -> Self {
        Self(format!("workflow:{wf_id}:{kind}"))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The payload carried by an [`EventEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A request to begin a run.
    RunStart {
        /// Initial run input.
        input: Value,
        /// Whether to advance a single step and pause.
        per_step: bool,
        /// Resume data, set when a run is started by resuming a suspension.
        resume_data: Option<Value>,
        /// Ambient per-run key/value bag seeded by the caller.
        request_context: serde_json::Map<String, Value>,
    },
    /// The run reached a terminal or paused/suspended status.
    RunFinish {
        /// Terminal (or paused/suspended) status.
        status: crate::snapshot::Status,
        /// Final output on success, `None` otherwise.
        result: Option<Value>,
        /// Encoded error on failure.
        error: Option<crate::error::EncodedError>,
    },
    /// Coordinator asks a worker to invoke a step.
    StepDispatch {
        /// Absolute label of the node being dispatched.
        label: String,
        /// Input payload for this attempt.
        payload: Value,
        /// 0-based attempt counter.
        attempt: u32,
    },
    /// A worker reports a successful step invocation.
    StepResult {
        /// Absolute label.
        label: String,
        /// Step output.
        output: Value,
        /// Attempt that produced this result.
        attempt: u32,
    },
    /// A worker reports a failed step invocation.
    StepFailed {
        /// Absolute label.
        label: String,
        /// Structurally encoded error.
        error: crate::error::EncodedError,
        /// Attempt that failed.
        attempt: u32,
    },
    /// A step suspended itself.
    StepSuspend {
        /// Absolute label.
        label: String,
        /// Suspension payload (includes `__workflow_meta`).
        suspend_payload: Value,
    },
    /// A suspended step is being resumed.
    StepResume {
        /// Absolute label.
        label: String,
        /// Data supplied to the resumed invocation.
        resume_data: Value,
    },
    /// A `sleep`/`sleep_until` node registered a wakeup.
    TimerSet {
        /// Absolute label of the sleeping node.
        label: String,
        /// Absolute wakeup time, epoch milliseconds.
        wake_at: i64,
    },
    /// A previously set timer elapsed.
    TimerFire {
        /// Absolute label of the sleeping node.
        label: String,
    },
    /// A cancellation request for the run.
    RunCancel,
    /// Acknowledgement that a run finished canceling.
    RunCanceled,
    /// Incremental snapshot diff, used by streaming views.
    SnapshotUpdate {
        /// Opaque diff payload (a serialized partial snapshot).
        diff: Value,
    },
}

/// A single bus event: kind plus routing/ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Run this event belongs to.
    pub run_id: String,
    /// Workflow this run was started from.
    pub wf_id: String,
    /// Monotonically increasing per-run sequence number.
    pub sequence: u64,
    /// The event payload.
    pub kind: EventKind,
    /// Optional correlation id, used to match request/response pairs
    /// (e.g. a `step.dispatch` and its `step.result`).
    pub correlation_id: Option<Uuid>,
}

impl EventEnvelope {
    /// Convenience constructor; correlation id defaults to a fresh uuid.
    pub fn new(run_id: impl Into<String>, wf_id: impl Into<String>, sequence: u64, kind: EventKind) -> Self {
        Self {
            run_id: run_id.into(),
            wf_id: wf_id.into(),
            sequence,
            kind,
            correlation_id: None,
        }
    }
}

/// A subscription handle; dropping it unsubscribes.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Receive the next event, or `None` once the bus has been closed.
    async fn recv(&mut self) -> Option<EventEnvelope>;
}

/// Pub/sub event bus contract (C1).
///
/// Implementations must guarantee per-topic FIFO delivery to each subscriber
/// and at-least-once delivery; publication never fails from the publisher's
/// perspective (the bus buffers internally).
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event onto a topic. Never returns an error to the caller;
    /// delivery failures are the bus's problem, not the publisher's.
    async fn publish(&self, topic: &Topic, event: EventEnvelope);

    /// Subscribe to a topic, receiving a private FIFO queue of its events.
    async fn subscribe(&self, topic: &Topic) -> Box<dyn Subscription>;
}
