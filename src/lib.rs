//! A durable, event-driven workflow engine.
//!
//! Workflows are built as a static graph of steps (plain async functions
//! wrapped as [`graph::Step`]) combined with `parallel`/`branch`/`doUntil`/
//! `doWhile`/`forEach`/`sleep`/`map`/sub-workflow nodes, committed once via
//! [`graph::WorkflowBuilder`], and registered under a stable name in a
//! [`registry::WorkflowRegistry`]. A [`coordinator::RunCoordinator`] drives
//! individual runs to completion, suspension, a parked timer, or a single
//! `perStep` pause, persisting a [`snapshot::RunSnapshot`] after every step
//! and publishing one event per state transition to an [`bus::EventBus`].
//! [`handle::RunHandle`]/[`handle::WorkflowHandle`] wrap a coordinator with
//! the external create/start/stream/resume/cancel/time-travel surface, and
//! [`scheduler::Scheduler`] polls for runs parked on a due timer and wakes
//! them.
//!
//! See `DESIGN.md` for the module-by-module design rationale.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// Error types shared across every module.
pub mod error;

/// Event Bus (C1): pub/sub of run events, in-memory today.
pub mod bus;

/// Snapshot Store (C2): the durable per-run record.
pub mod snapshot;

/// Step Graph (C3): the immutable compiled plan of nodes.
pub mod graph;

/// Step Runtime (C4): the context handed to a step's execute callable.
pub mod runtime;

/// Workflow Registry (C6): committed plans, keyed by workflow name.
pub mod registry;

/// Coordinator tunables.
pub mod config;

/// Run Coordinator (C5): drives a single run to its next stopping point.
pub mod coordinator;

/// Run Handle (C7): the external per-run and per-workflow API surface.
pub mod handle;

/// Scheduler (C8): timer wakeups and per-run serialization.
pub mod scheduler;

pub use bus::{EventBus, EventEnvelope, EventKind, InMemoryBus, Topic};
pub use config::CoordinatorConfig;
pub use coordinator::RunCoordinator;
pub use error::{EncodedError, Result, StepFlowError};
pub use graph::{Plan, Schema, Step, StepOutcome, WorkflowBuilder};
pub use handle::{RunHandle, WorkflowHandle};
pub use registry::WorkflowRegistry;
pub use runtime::ExecutionContext;
pub use scheduler::Scheduler;
pub use snapshot::{InMemorySnapshotStore, ListFilter, RunContext, RunSnapshot, SnapshotStore, Status, StepResult, StepStatus};
