//! Run Handle (C7): the external per-run and per-workflow API surface.
//!
//! A thin wrapper around a [`RunCoordinator`] exposing
//! start/startAsync/stream/resume/cancel/timeTravel/restart as the only
//! public entry points; the coordinator's traversal loop stays internal.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::bus::{EventEnvelope, EventKind, Subscription, Topic};
use crate::coordinator::RunCoordinator;
use crate::error::{Result, StepFlowError};
use crate::snapshot::{RunSnapshot, Status};

/// A single modern-schema stream event (`stream`): `{type, from, runId, payload}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamEvent {
    /// One of `workflow-start`, `workflow-step-start`, `workflow-step-result`,
    /// `workflow-step-failed`, `workflow-step-suspended`,
    /// `workflow-step-resumed`, `workflow-step-waiting`,
    /// `workflow-step-waiting-done`, `workflow-cancel`, `workflow-canceled`,
    /// `workflow-snapshot-update`, `workflow-paused`, `workflow-finish`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Always `"WORKFLOW"`; mirrors the emitter tag the modern schema uses
    /// to distinguish workflow-level events from tool-call events that may
    /// interleave inside a step.
    pub from: &'static str,
    /// The run this event belongs to.
    #[serde(rename = "runId")]
    pub run_id: String,
    /// Event-specific payload; `None` for the bare sentinel half of a
    /// double-emitted `workflow-start`/`workflow-finish`.
    pub payload: Option<Value>,
}

/// Maps one internal event to its modern-schema form. `RunStart` and
/// `RunFinish` are each emitted twice: a bare sentinel carrying only
/// `runId`, then the full payload.
fn to_modern(envelope: &EventEnvelope) -> Vec<StreamEvent> {
    let run_id = envelope.run_id.clone();
    let sentinel = |kind: &'static str| StreamEvent { kind, from: "WORKFLOW", run_id: run_id.clone(), payload: None };
    let event = |kind: &'static str, payload: Value| StreamEvent { kind, from: "WORKFLOW", run_id: run_id.clone(), payload: Some(payload) };

    match &envelope.kind {
        EventKind::RunStart { input, per_step, resume_data, request_context } => vec![
            sentinel("workflow-start"),
            event(
                "workflow-start",
                serde_json::json!({"input": input, "perStep": per_step, "resumeData": resume_data, "requestContext": request_context}),
            ),
        ],
        EventKind::StepDispatch { label, payload, attempt } => {
            vec![event("workflow-step-start", serde_json::json!({"label": label, "payload": payload, "attempt": attempt}))]
        }
        EventKind::StepResult { label, output, attempt } => {
            vec![event("workflow-step-result", serde_json::json!({"label": label, "output": output, "attempt": attempt}))]
        }
        EventKind::StepFailed { label, error, attempt } => {
            vec![event("workflow-step-failed", serde_json::json!({"label": label, "error": error, "attempt": attempt}))]
        }
        EventKind::StepSuspend { label, suspend_payload } => {
            vec![event("workflow-step-suspended", serde_json::json!({"label": label, "suspendPayload": suspend_payload}))]
        }
        EventKind::StepResume { label, resume_data } => {
            vec![event("workflow-step-resumed", serde_json::json!({"label": label, "resumeData": resume_data}))]
        }
        EventKind::TimerSet { label, wake_at } => {
            vec![event("workflow-step-waiting", serde_json::json!({"label": label, "wakeAt": wake_at}))]
        }
        EventKind::TimerFire { label } => {
            vec![event("workflow-step-waiting-done", serde_json::json!({"label": label}))]
        }
        EventKind::RunCancel => vec![event("workflow-cancel", serde_json::json!({}))],
        EventKind::RunCanceled => vec![event("workflow-canceled", serde_json::json!({}))],
        EventKind::SnapshotUpdate { diff } => vec![event("workflow-snapshot-update", serde_json::json!({"diff": diff}))],
        EventKind::RunFinish { status, result, error } => {
            if *status == Status::Paused {
                return vec![event("workflow-paused", serde_json::json!({"workflowStatus": status, "output": result}))];
            }
            vec![
                sentinel("workflow-finish"),
                event(
                    "workflow-finish",
                    serde_json::json!({
                        "metadata": {},
                        "output": {"usage": Value::Null, "result": result},
                        "workflowStatus": status,
                        "error": error,
                    }),
                ),
            ]
        }
    }
}

/// Runs `events` through unchanged, stopping the stream right after (and
/// including) the first event for which `stop_after` returns true.
fn until_and_including<F>(events: BoxStream<'static, EventEnvelope>, stop_after: F) -> BoxStream<'static, EventEnvelope>
where
    F: Fn(&EventEnvelope) -> bool + Send + 'static,
{
    stream::unfold((events, stop_after, false), |(mut events, stop_after, done)| async move {
        if done {
            return None;
        }
        let event = events.next().await?;
        let stop = stop_after(&event);
        Some((event, (events, stop_after, stop)))
    })
    .boxed()
}

/// A single legacy-schema stream event (`streamLegacy`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct LegacyEvent {
    /// One of `start`, `step-start`, `step-result`, `step-finish`,
    /// `step-waiting`, `step-suspended`, `finish`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Event-specific payload.
    pub payload: Value,
}

fn to_legacy(envelope: &EventEnvelope) -> Option<LegacyEvent> {
    let payload = match &envelope.kind {
        EventKind::RunStart { input, .. } => {
            return Some(LegacyEvent { kind: "start", payload: input.clone() })
        }
        EventKind::StepDispatch { label, payload, .. } => {
            serde_json::json!({"label": label, "payload": payload})
        }
        EventKind::StepResult { label, output, .. } => {
            return Some(LegacyEvent {
                kind: "step-result",
                payload: serde_json::json!({"label": label, "output": output}),
            })
        }
        EventKind::StepFailed { label, error, .. } => {
            return Some(LegacyEvent {
                kind: "step-finish",
                payload: serde_json::json!({"label": label, "error": error}),
            })
        }
        EventKind::StepSuspend { label, suspend_payload } => {
            return Some(LegacyEvent {
                kind: "step-suspended",
                payload: serde_json::json!({"label": label, "suspendPayload": suspend_payload}),
            })
        }
        EventKind::TimerSet { label, wake_at } => {
            return Some(LegacyEvent {
                kind: "step-waiting",
                payload: serde_json::json!({"label": label, "wakeAt": wake_at}),
            })
        }
        EventKind::RunFinish { status, result, error } => {
            return Some(LegacyEvent {
                kind: "finish",
                payload: serde_json::json!({"status": status, "result": result, "error": error}),
            })
        }
        _ => return None,
    };
    Some(LegacyEvent { kind: "step-start", payload })
}

async fn subscribe_stream(coordinator: &Arc<RunCoordinator>, run_id: &str) -> BoxStream<'static, EventEnvelope> {
    let topic = Topic::run(run_id, crate::coordinator::RUN_EVENTS_TOPIC);
    let subscription: Box<dyn Subscription> = coordinator.bus.subscribe(&topic).await;
    stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        Some((event, sub))
    })
    .boxed()
}

/// A handle bound to a single run.
pub struct RunHandle {
    coordinator: Arc<RunCoordinator>,
    wf_id: String,
    run_id: String,
}

impl RunHandle {
    /// `createRun({runId?, resourceId?})`: idempotent by `run_id`.
    pub async fn create(
        coordinator: Arc<RunCoordinator>,
        wf_id: impl Into<String>,
        run_id: impl Into<String>,
        resource_id: Option<String>,
        input: Value,
    ) -> Result<Self> {
        let wf_id = wf_id.into();
        let run_id = run_id.into();
        coordinator.create_run(&wf_id, &run_id, resource_id, input).await?;
        Ok(Self { coordinator, wf_id, run_id })
    }

    /// This run's identity.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// `start({inputData, requestContext?, perStep?}) → finalStatus`. The
    /// run's initial input was already supplied to `create`; this simply
    /// drives it to its next stopping point.
    pub async fn start(&self, request_context: serde_json::Map<String, Value>, per_step: bool) -> Result<RunSnapshot> {
        let snapshot = self.coordinator.run(&self.wf_id, &self.run_id, request_context, per_step).await;
        self.invoke_lifecycle_hooks(&snapshot).await;
        snapshot
    }

    /// `startAsync(…) → {runId}`: fire-and-forget; spawns the run and
    /// returns immediately. Completion is polled via
    /// [`WorkflowHandle::get_workflow_run_execution_result`].
    pub fn start_async(&self, request_context: serde_json::Map<String, Value>, per_step: bool) -> String {
        let coordinator = self.coordinator.clone();
        let wf_id = self.wf_id.clone();
        let run_id = self.run_id.clone();
        tokio::spawn(async move {
            let _ = coordinator.run(&wf_id, &run_id, request_context, per_step).await;
        });
        self.run_id.clone()
    }

    /// `stream({inputData, perStep?, closeOnSuspend?}) → {fullStream, result}`.
    /// Subscribes to this run's events before kicking off execution, so no
    /// events are missed; the returned stream ends once `run.finish` (or,
    /// with `close_on_suspend`, `step.suspend`/`timer.set`) is observed.
    pub async fn stream(
        &self,
        request_context: serde_json::Map<String, Value>,
        per_step: bool,
        close_on_suspend: bool,
    ) -> (BoxStream<'static, StreamEvent>, tokio::task::JoinHandle<Result<RunSnapshot>>) {
        let events = subscribe_stream(&self.coordinator, &self.run_id).await;
        let events = until_and_including(events, move |event| {
            matches!(event.kind, EventKind::RunFinish { .. })
                || (close_on_suspend && matches!(event.kind, EventKind::StepSuspend { .. } | EventKind::TimerSet { .. }))
        });
        let events = events.flat_map(|event| stream::iter(to_modern(&event))).boxed();

        let coordinator = self.coordinator.clone();
        let wf_id = self.wf_id.clone();
        let run_id = self.run_id.clone();
        let handle = tokio::spawn(async move { coordinator.run(&wf_id, &run_id, request_context, per_step).await });

        (events, handle)
    }

    /// `streamLegacy({inputData}) → {stream, getWorkflowState()}`: the older
    /// event schema, kept for compatibility.
    pub async fn stream_legacy(
        &self,
        request_context: serde_json::Map<String, Value>,
    ) -> (BoxStream<'static, LegacyEvent>, tokio::task::JoinHandle<Result<RunSnapshot>>) {
        let events = subscribe_stream(&self.coordinator, &self.run_id).await;
        let events = events.filter_map(|e| futures::future::ready(to_legacy(&e))).boxed();

        let coordinator = self.coordinator.clone();
        let wf_id = self.wf_id.clone();
        let run_id = self.run_id.clone();
        let handle = tokio::spawn(async move { coordinator.run(&wf_id, &run_id, request_context, false).await });

        (events, handle)
    }

    /// `getWorkflowState()` companion to [`Self::stream_legacy`]: the run's
    /// current snapshot at call time.
    pub async fn get_workflow_state(&self) -> Result<Option<RunSnapshot>> {
        Ok(self.coordinator.snapshots.load(&self.wf_id, &self.run_id).await?)
    }

    /// `resume({step, resumeData, requestContext?, perStep?})`.
    pub async fn resume(
        &self,
        label: Option<String>,
        resume_data: Value,
        request_context: serde_json::Map<String, Value>,
        per_step: bool,
    ) -> Result<RunSnapshot> {
        let snapshot = self
            .coordinator
            .resume(&self.wf_id, &self.run_id, label, resume_data, request_context, per_step)
            .await;
        self.invoke_lifecycle_hooks(&snapshot).await;
        snapshot
    }

    /// `resumeStream(…)`: resume, observing the event stream as it replays.
    pub async fn resume_stream(
        &self,
        label: Option<String>,
        resume_data: Value,
        request_context: serde_json::Map<String, Value>,
        per_step: bool,
    ) -> (BoxStream<'static, StreamEvent>, tokio::task::JoinHandle<Result<RunSnapshot>>) {
        let events = subscribe_stream(&self.coordinator, &self.run_id).await;
        let events = until_and_including(events, |event| matches!(event.kind, EventKind::RunFinish { .. }));
        let events = events.flat_map(|event| stream::iter(to_modern(&event))).boxed();

        let coordinator = self.coordinator.clone();
        let wf_id = self.wf_id.clone();
        let run_id = self.run_id.clone();
        let handle = tokio::spawn(async move {
            coordinator.resume(&wf_id, &run_id, label, resume_data, request_context, per_step).await
        });

        (events, handle)
    }

    /// `cancel()`.
    pub async fn cancel(&self) -> Result<()> {
        self.coordinator.cancel(&self.wf_id, &self.run_id).await
    }

    /// `timeTravel(…)`.
    pub async fn time_travel(&self, target_label: &str) -> Result<RunSnapshot> {
        self.coordinator.time_travel(&self.wf_id, &self.run_id, target_label).await
    }

    /// `restart()`: not supported in the durable/evented execution model.
    pub async fn restart(&self) -> Result<RunSnapshot> {
        Err(StepFlowError::RestartNotSupported)
    }

    async fn invoke_lifecycle_hooks(&self, outcome: &Result<RunSnapshot>) {
        let plan = match self.coordinator.registry.get(&self.wf_id) {
            Ok(plan) => plan,
            Err(_) => return,
        };
        match outcome {
            Ok(snapshot) if snapshot.status.is_terminal() => {
                if snapshot.status == Status::Success {
                    if let Some(on_finish) = &plan.options.on_finish {
                        on_finish(snapshot.value.clone());
                    }
                } else if snapshot.status == Status::Failed {
                    if let Some(on_error) = &plan.options.on_error {
                        on_error(serde_json::json!({
                            "error": snapshot.error,
                            "steps": snapshot.context.steps,
                        }));
                    }
                }
            }
            _ => {}
        }
    }
}

/// Workflow-level operations that aren't scoped to a single run.
pub struct WorkflowHandle {
    coordinator: Arc<RunCoordinator>,
    wf_id: String,
}

impl WorkflowHandle {
    /// Bind to a committed workflow id.
    pub fn new(coordinator: Arc<RunCoordinator>, wf_id: impl Into<String>) -> Self {
        Self { coordinator, wf_id: wf_id.into() }
    }

    /// `createRun({runId?, resourceId?})`.
    pub async fn create_run(
        &self,
        run_id: impl Into<String>,
        resource_id: Option<String>,
        input: Value,
    ) -> Result<RunHandle> {
        RunHandle::create(self.coordinator.clone(), self.wf_id.clone(), run_id, resource_id, input).await
    }

    /// `getWorkflowRunById(runId)`.
    pub async fn get_workflow_run_by_id(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        Ok(self.coordinator.snapshots.load(&self.wf_id, run_id).await?)
    }

    /// `listWorkflowRuns()`.
    pub async fn list_workflow_runs(&self, filter: crate::snapshot::ListFilter) -> Result<(Vec<RunSnapshot>, usize)> {
        Ok(self.coordinator.snapshots.list(&self.wf_id, filter).await?)
    }

    /// `getWorkflowRunExecutionResult(runId)`: the current (possibly
    /// non-terminal) snapshot, for polling after `startAsync`.
    pub async fn get_workflow_run_execution_result(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        Ok(self.coordinator.snapshots.load(&self.wf_id, run_id).await?)
    }
}
