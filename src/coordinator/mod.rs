//! Run Coordinator (C5): drives a single run's graph to completion, pause,
//! suspension, or cancellation.
//!
//! A traversal loop holds shared mutable run state behind an async mutex,
//! dispatches node executors, and persists a snapshot after each one. On
//! top of plain sequential traversal it implements the wider combinator
//! tree (parallel/branch/loop/foreach/sleep/map/sub-workflow) and the
//! suspend/resume/cancel/time-travel protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use crate::bus::{EventBus, EventEnvelope, EventKind, Topic};
use crate::config::CoordinatorConfig;
use crate::error::{EncodedError, Result, StepFlowError};
use crate::graph::{BranchArm, ForeachOptions, GraphNode, MapSource, MapSpec, Plan, RetryPolicy};
use crate::registry::WorkflowRegistry;
use crate::runtime::ExecutionContext;
use crate::snapshot::{RunSnapshot, SnapshotStore, Status, StepResult, StepStatus};

/// Outcome of running a single graph node to its next stopping point.
#[derive(Debug, Clone)]
enum NodeOutcome {
    /// The node (and everything under it) completed; carries the value to
    /// forward downstream.
    Value(Value),
    /// A step suspended somewhere under this node.
    Suspended,
    /// A node is parked on a timer somewhere under this node.
    Sleeping,
    /// A step voluntarily aborted in response to cancellation.
    Aborted,
    /// A step requested the whole run succeed immediately.
    Bailed(Value),
    /// `perStep` advanced exactly one freshly-executed top-level node.
    Paused(Value),
}

/// Per-run execution state shared by every node in the run's traversal.
struct ExecState {
    coordinator: Arc<RunCoordinator>,
    plan: Arc<Plan>,
    wf_id: String,
    run_id: String,
    snapshot: Mutex<RunSnapshot>,
    request_context: Arc<serde_json::Map<String, Value>>,
    abort_rx: watch::Receiver<bool>,
    sequence: AtomicU64,
    /// Stop after exactly one top-level node completes, pausing the run.
    per_step: bool,
}

impl ExecState {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    async fn publish(&self, kind: EventKind) {
        let seq = self.next_sequence();
        let topic = Topic::run(&self.run_id, RUN_EVENTS_TOPIC);
        let envelope = EventEnvelope::new(self.run_id.clone(), self.wf_id.clone(), seq, kind);
        self.coordinator.bus.publish(&topic, envelope).await;
    }

    async fn persist(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.last_sequence = self.sequence.load(Ordering::SeqCst);
        snapshot.timestamp = Utc::now().timestamp_millis();
        self.coordinator
            .snapshots
            .persist(&self.wf_id, &self.run_id, snapshot.clone())
            .await?;
        Ok(())
    }

    fn is_aborted(&self) -> bool {
        *self.abort_rx.borrow()
    }

    /// The workflow-level `validateInputs` flag.
    fn validate_inputs(&self) -> bool {
        self.plan.options.validate_inputs
    }

    /// Run the root sequence from wherever the snapshot left off.
    fn run_root(self: &Arc<Self>) -> BoxFuture<'_, Result<NodeOutcome>> {
        let nodes = self.plan.nodes.clone();
        Box::pin(async move { self.run_sequence(&nodes, self.snapshot.lock().await.value.clone(), &[]).await })
    }

    async fn run_sequence(self: &Arc<Self>, nodes: &[GraphNode], mut current: Value, path: &[String]) -> Result<NodeOutcome> {
        for node in nodes {
            let label = node.label().to_string();
            let already_settled = self.replay_if_settled(&label).await.is_some();
            match self.run_node(node, current.clone(), path).await? {
                NodeOutcome::Value(v) => {
                    current = v;
                    if self.per_step && !already_settled {
                        return Ok(NodeOutcome::Paused(current));
                    }
                }
                other => return Ok(other),
            }
        }
        Ok(NodeOutcome::Value(current))
    }

    /// `path` is the list of ancestor combinator labels enclosing `node`,
    /// used to build `__workflow_meta.path` for any step that suspends
    /// underneath it.
    fn run_node<'a>(self: &'a Arc<Self>, node: &'a GraphNode, input: Value, path: &'a [String]) -> BoxFuture<'a, Result<NodeOutcome>> {
        Box::pin(async move {
            if self.is_aborted() {
                return Ok(NodeOutcome::Aborted);
            }

            let label = node.label().to_string();
            if let Some(outcome) = self.replay_if_settled(&label).await {
                return Ok(outcome);
            }

            match node {
                GraphNode::Step { step_id, .. } => self.run_step(&label, step_id, input, path).await,
                GraphNode::Parallel { children, .. } => self.run_parallel(&label, children, input, path).await,
                GraphNode::Branch { arms, .. } => self.run_branch(&label, arms, input, path).await,
                GraphNode::DoUntil { node, predicate, .. } => {
                    self.run_do_loop(&label, node, predicate.clone(), input, true, path).await
                }
                GraphNode::DoWhile { node, predicate, .. } => {
                    self.run_do_loop(&label, node, predicate.clone(), input, false, path).await
                }
                GraphNode::Foreach { node, options, .. } => self.run_foreach(&label, node, options, input, path).await,
                GraphNode::Sleep { delay_ms, .. } => self.run_sleep(&label, *delay_ms, input).await,
                GraphNode::SleepUntil { wake_at, .. } => self.run_sleep_until(&label, *wake_at, input).await,
                GraphNode::Map { spec, .. } => self.run_map(&label, spec, input).await,
                GraphNode::SubWorkflow { workflow_id, .. } => self.run_sub_workflow(&label, workflow_id, input, path).await,
            }
        })
    }

    /// If this label already reached a terminal/settled state in a prior
    /// attempt at this run, short-circuit instead of re-executing — this is
    /// what makes replaying `run_sequence` after a restart idempotent.
    async fn replay_if_settled(&self, label: &str) -> Option<NodeOutcome> {
        let snapshot = self.snapshot.lock().await;
        match snapshot.context.steps.get(label) {
            Some(result) if result.status == StepStatus::Success => {
                result.output.clone().map(NodeOutcome::Value)
            }
            Some(result) if result.status == StepStatus::Suspended && result.resume_payload.is_none() => {
                Some(NodeOutcome::Suspended)
            }
            Some(result) if result.status == StepStatus::Waiting => Some(NodeOutcome::Sleeping),
            Some(result) if result.status == StepStatus::Failed => {
                None // let run_step re-derive and return the terminal error
            }
            _ => None,
        }
    }

    async fn run_step(self: &Arc<Self>, label: &str, step_id: &str, input: Value, path: &[String]) -> Result<NodeOutcome> {
        let step = self
            .plan
            .step(step_id)
            .ok_or_else(|| StepFlowError::Internal(format!("step not registered: {step_id}")))?
            .clone();

        if self.validate_inputs() {
            step.input_schema
                .validate(&input)
                .map_err(|message| StepFlowError::InputValidation { label: label.to_string(), message })?;
        }

        let policy = step
            .retry_policy
            .clone()
            .or_else(|| self.plan.retry_config.clone())
            .unwrap_or_else(|| self.coordinator.config.default_retry.clone());

        let mut attempt = {
            let snapshot = self.snapshot.lock().await;
            snapshot.retry_count.get(label).copied().unwrap_or(0)
        };

        loop {
            if self.is_aborted() {
                return Ok(NodeOutcome::Aborted);
            }

            let started_at = Utc::now().timestamp_millis();
            let (resume_data, init_data, prior_results) = {
                let mut snapshot = self.snapshot.lock().await;
                let resume_data = snapshot
                    .context
                    .steps
                    .get(label)
                    .and_then(|r| r.resume_payload.clone());
                snapshot
                    .context
                    .steps
                    .insert(label.to_string(), StepResult::running(input.clone(), started_at));
                if !snapshot.active_paths.iter().any(|p| p == label) {
                    snapshot.active_paths.push(label.to_string());
                }
                (resume_data, snapshot.context.input.clone(), snapshot.context.steps.clone())
            };

            self.publish(EventKind::StepDispatch { label: label.to_string(), payload: input.clone(), attempt })
                .await;
            self.persist().await?;

            let ctx = ExecutionContext::new(
                input.clone(),
                resume_data,
                attempt,
                self.run_id.clone(),
                self.request_context.clone(),
                init_data,
                Arc::new(prior_results),
                self.abort_rx.clone(),
            );

            let outcome = (step.execute)(ctx).await;
            let ended_at = Utc::now().timestamp_millis();

            match outcome {
                Ok(crate::graph::StepOutcome::Success(output)) => {
                    if self.validate_inputs() {
                        step.output_schema
                            .validate(&output)
                            .map_err(|message| StepFlowError::InputValidation { label: label.to_string(), message })?;
                    }
                    self.settle_step(label, |r| r.succeed(output.clone(), ended_at)).await;
                    self.publish(EventKind::StepResult { label: label.to_string(), output: output.clone(), attempt })
                        .await;
                    self.persist().await?;
                    return Ok(NodeOutcome::Value(output));
                }
                Ok(crate::graph::StepOutcome::Bail(output)) => {
                    self.settle_step(label, |r| r.succeed(output.clone(), ended_at)).await;
                    self.persist().await?;
                    return Ok(NodeOutcome::Bailed(output));
                }
                Ok(crate::graph::StepOutcome::Suspend(payload)) => {
                    let mut full_path = path.to_vec();
                    full_path.push(label.to_string());
                    let meta = serde_json::json!({"path": full_path, "runId": self.run_id});
                    let suspend_payload = match payload {
                        Value::Object(mut map) => {
                            map.insert("__workflow_meta".to_string(), meta.clone());
                            Value::Object(map)
                        }
                        other => serde_json::json!({"value": other, "__workflow_meta": meta}),
                    };
                    self.settle_step(label, |r| r.suspend(suspend_payload.clone(), ended_at)).await;
                    {
                        let mut snapshot = self.snapshot.lock().await;
                        snapshot.suspended_paths.insert(label.to_string(), Value::Null);
                        snapshot.resume_labels.insert(label.to_string(), meta);
                    }
                    self.publish(EventKind::StepSuspend { label: label.to_string(), suspend_payload })
                        .await;
                    self.persist().await?;
                    return Ok(NodeOutcome::Suspended);
                }
                Ok(crate::graph::StepOutcome::Abort) => {
                    self.persist().await?;
                    return Ok(NodeOutcome::Aborted);
                }
                Err(error) => {
                    if attempt < policy.attempts {
                        attempt += 1;
                        {
                            let mut snapshot = self.snapshot.lock().await;
                            snapshot.retry_count.insert(label.to_string(), attempt);
                        }
                        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    self.settle_step(label, |r| r.fail(error.clone(), ended_at)).await;
                    {
                        let mut snapshot = self.snapshot.lock().await;
                        snapshot.active_paths.retain(|p| p != label);
                    }
                    self.publish(EventKind::StepFailed { label: label.to_string(), error: error.clone(), attempt })
                        .await;
                    self.persist().await?;
                    return Err(StepFlowError::StepFailure { label: label.to_string(), error });
                }
            }
        }
    }

    async fn settle_step(&self, label: &str, transform: impl FnOnce(StepResult) -> StepResult) {
        let mut snapshot = self.snapshot.lock().await;
        if let Some(existing) = snapshot.context.steps.remove(label) {
            snapshot.context.steps.insert(label.to_string(), transform(existing));
        }
        snapshot.active_paths.retain(|p| p != label);
    }

    async fn run_parallel(self: &Arc<Self>, label: &str, children: &[GraphNode], input: Value, path: &[String]) -> Result<NodeOutcome> {
        let mut child_path = path.to_vec();
        child_path.push(label.to_string());
        let futures = children
            .iter()
            .map(|child| async move { (child.label().to_string(), self.run_node(child, input.clone(), &child_path).await) });
        let results = join_all(futures).await;
        combine_keyed(results)
    }

    async fn run_branch(self: &Arc<Self>, label: &str, arms: &[BranchArm], input: Value, path: &[String]) -> Result<NodeOutcome> {
        let checks = arms
            .iter()
            .map(|arm| async move { ((arm.predicate)(input.clone()).await, arm) });
        let evaluated = join_all(checks).await;

        let matching: Vec<&BranchArm> = evaluated
            .into_iter()
            .filter_map(|(matched, arm)| if matched { Some(arm) } else { None })
            .collect();

        if matching.is_empty() {
            return Ok(NodeOutcome::Value(input));
        }

        let mut child_path = path.to_vec();
        child_path.push(label.to_string());
        let futures = matching
            .into_iter()
            .map(|arm| async move { (arm.label.clone(), self.run_node(&arm.node, input.clone(), &child_path).await) });
        let results = join_all(futures).await;
        combine_keyed(results)
    }

    async fn run_do_loop(
        self: &Arc<Self>,
        label: &str,
        node: &GraphNode,
        predicate: crate::graph::builder::Predicate,
        input: Value,
        until: bool,
        path: &[String],
    ) -> Result<NodeOutcome> {
        let mut child_path = path.to_vec();
        child_path.push(label.to_string());
        let mut current = input;
        let mut iteration: u64 = 0;
        loop {
            self.publish(EventKind::SnapshotUpdate {
                diff: serde_json::json!({"loop": label, "iteration": iteration}),
            })
            .await;

            match self.run_node(node, current.clone(), &child_path).await? {
                NodeOutcome::Value(v) => current = v,
                other => return Ok(other),
            }

            let should_stop = predicate(current.clone()).await;
            iteration += 1;
            let stop = if until { should_stop } else { !should_stop };
            if stop {
                return Ok(NodeOutcome::Value(current));
            }
        }
    }

    async fn run_foreach(
        self: &Arc<Self>,
        label: &str,
        node: &GraphNode,
        options: &ForeachOptions,
        input: Value,
        path: &[String],
    ) -> Result<NodeOutcome> {
        let mut child_path = path.to_vec();
        child_path.push(label.to_string());
        let items = input.as_array().cloned().unwrap_or_default();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(options.concurrency.max(1)));

        let futures = items.into_iter().map(|item| {
            let semaphore = semaphore.clone();
            let child_path = child_path.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                self.run_node(node, item, &child_path).await
            }
        });
        let results: Vec<Result<NodeOutcome>> = join_all(futures).await;
        combine_ordered(results)
    }

    async fn run_sleep(self: &Arc<Self>, label: &str, delay_ms: u64, input: Value) -> Result<NodeOutcome> {
        let wake_at = Utc::now().timestamp_millis() + delay_ms as i64;
        self.run_sleep_until(label, wake_at, input).await
    }

    async fn run_sleep_until(self: &Arc<Self>, label: &str, wake_at: i64, input: Value) -> Result<NodeOutcome> {
        let now = Utc::now().timestamp_millis();
        if now >= wake_at {
            self.settle_step(label, |r| r.succeed(r.payload.clone(), now)).await;
            {
                let mut snapshot = self.snapshot.lock().await;
                snapshot.waiting_paths.remove(label);
            }
            self.persist().await?;
            return Ok(NodeOutcome::Value(input));
        }

        {
            let mut snapshot = self.snapshot.lock().await;
            snapshot
                .context
                .steps
                .insert(label.to_string(), StepResult::running(input.clone(), now).wait());
            snapshot.waiting_paths.insert(label.to_string(), wake_at);
            if !snapshot.active_paths.iter().any(|p| p == label) {
                snapshot.active_paths.push(label.to_string());
            }
        }
        self.publish(EventKind::TimerSet { label: label.to_string(), wake_at }).await;
        self.persist().await?;
        Ok(NodeOutcome::Sleeping)
    }

    async fn run_map(self: &Arc<Self>, label: &str, spec: &MapSpec, input: Value) -> Result<NodeOutcome> {
        let (init_data, prior_results) = {
            let snapshot = self.snapshot.lock().await;
            (snapshot.context.input.clone(), snapshot.context.steps.clone())
        };
        let ctx = ExecutionContext::new(
            input,
            None,
            0,
            self.run_id.clone(),
            self.request_context.clone(),
            init_data,
            Arc::new(prior_results.clone()),
            self.abort_rx.clone(),
        );

        let mut object = serde_json::Map::new();
        for (key, source) in &spec.fields {
            let value = resolve_map_source(source, &ctx, &prior_results);
            object.insert(key.clone(), value);
        }
        let value = Value::Object(object);
        self.settle_step(label, |r| r.succeed(value.clone(), Utc::now().timestamp_millis()))
            .await;
        self.persist().await?;
        Ok(NodeOutcome::Value(value))
    }

    async fn run_sub_workflow(self: &Arc<Self>, label: &str, workflow_id: &str, input: Value, path: &[String]) -> Result<NodeOutcome> {
        let sub_plan = self.coordinator.registry.get(workflow_id).map_err(|e| StepFlowError::Internal(e.to_string()))?;
        let sub_run_id = format!("{}/{}", self.run_id, label);

        let outcome = self
            .coordinator
            .clone()
            .run_nested(sub_plan.clone(), sub_run_id.clone(), input, self.request_context.clone(), self.abort_rx.clone())
            .await?;

        let now = Utc::now().timestamp_millis();
        match &outcome {
            NodeOutcome::Value(v) => {
                self.settle_step(label, |r| r.succeed(v.clone(), now)).await;
                self.persist().await?;
            }
            NodeOutcome::Bailed(v) => {
                self.settle_step(label, |r| r.succeed(v.clone(), now)).await;
                self.persist().await?;
            }
            NodeOutcome::Suspended | NodeOutcome::Sleeping => {
                let mut full_path = path.to_vec();
                full_path.push(label.to_string());
                let meta = serde_json::json!({"path": full_path, "runId": sub_run_id, "parentRunId": self.run_id});
                self.settle_step(label, |r| r.suspend(serde_json::json!({"__workflow_meta": meta}), now)).await;
                {
                    let mut snapshot = self.snapshot.lock().await;
                    snapshot.suspended_paths.insert(label.to_string(), Value::Null);
                    snapshot.resume_labels.insert(label.to_string(), meta);
                    if !snapshot.active_paths.iter().any(|p| p == label) {
                        snapshot.active_paths.push(label.to_string());
                    }
                }
                self.persist().await?;
            }
            NodeOutcome::Aborted => {
                self.persist().await?;
            }
            // `run_nested` never sets `per_step`, so a child run cannot
            // actually pause; handled for exhaustiveness the same way a
            // suspension is, since both leave the child run non-terminal.
            NodeOutcome::Paused(_) => {
                let mut full_path = path.to_vec();
                full_path.push(label.to_string());
                let meta = serde_json::json!({"path": full_path, "runId": sub_run_id, "parentRunId": self.run_id});
                {
                    let mut snapshot = self.snapshot.lock().await;
                    snapshot.suspended_paths.insert(label.to_string(), Value::Null);
                    snapshot.resume_labels.insert(label.to_string(), meta);
                }
                self.persist().await?;
            }
        }
        Ok(outcome)
    }
}

fn resolve_map_source(source: &MapSource, ctx: &ExecutionContext, steps: &HashMap<String, StepResult>) -> Value {
    match source {
        MapSource::InitData { path } => dotted_get(ctx.get_init_data(), path),
        MapSource::StepRef { refs, path } => {
            for label in refs {
                if let Some(result) = steps.get(label) {
                    if result.status == StepStatus::Success {
                        if let Some(output) = &result.output {
                            return dotted_get(output, path);
                        }
                    }
                }
            }
            Value::Null
        }
        MapSource::RequestContextPath { path } => {
            let value = Value::Object(ctx.request_context.as_ref().clone());
            dotted_get(&value, path)
        }
        MapSource::Value(v) => v.clone(),
        MapSource::Fn(f) => f(ctx),
    }
}

fn dotted_get(value: &Value, path: &str) -> Value {
    if path == "." || path.is_empty() {
        return value.clone();
    }
    let mut current = value;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn combine_keyed(results: Vec<(String, Result<NodeOutcome>)>) -> Result<NodeOutcome> {
    // `results` holds every branch's already-completed outcome (the caller
    // awaited them all via `join_all`), so surfacing the first error here
    // still honors WaitAll: nothing was cancelled early to get it.
    let mut outcomes = Vec::with_capacity(results.len());
    for (label, result) in results {
        outcomes.push((label, result?));
    }

    if outcomes.iter().any(|(_, o)| matches!(o, NodeOutcome::Aborted)) {
        return Ok(NodeOutcome::Aborted);
    }
    if outcomes.iter().any(|(_, o)| matches!(o, NodeOutcome::Suspended | NodeOutcome::Sleeping)) {
        return Ok(NodeOutcome::Suspended);
    }
    if let Some((_, NodeOutcome::Bailed(v))) = outcomes.iter().find(|(_, o)| matches!(o, NodeOutcome::Bailed(_))) {
        return Ok(NodeOutcome::Bailed(v.clone()));
    }

    let mut object = serde_json::Map::new();
    for (label, outcome) in outcomes {
        if let NodeOutcome::Value(v) = outcome {
            object.insert(label, v);
        }
    }
    Ok(NodeOutcome::Value(Value::Object(object)))
}

fn combine_ordered(results: Vec<Result<NodeOutcome>>) -> Result<NodeOutcome> {
    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        outcomes.push(result?);
    }

    if outcomes.iter().any(|o| matches!(o, NodeOutcome::Aborted)) {
        return Ok(NodeOutcome::Aborted);
    }
    if outcomes.iter().any(|o| matches!(o, NodeOutcome::Suspended | NodeOutcome::Sleeping)) {
        return Ok(NodeOutcome::Suspended);
    }
    if let Some(NodeOutcome::Bailed(v)) = outcomes.iter().find(|o| matches!(o, NodeOutcome::Bailed(_))) {
        return Ok(NodeOutcome::Bailed(v.clone()));
    }

    let values: Vec<Value> = outcomes
        .into_iter()
        .filter_map(|o| match o {
            NodeOutcome::Value(v) => Some(v),
            _ => None,
        })
        .collect();
    Ok(NodeOutcome::Value(Value::Array(values)))
}

/// Every event for a run lands on this single topic, in sequence order;
/// `EventKind` itself carries the finer-grained type. A bus implementation
/// dedups by `(run_id, sequence)` regardless of topic, so fanning the same
/// run out across several kind-specific topics would make that dedup
/// collide — one topic per run avoids the problem entirely.
pub(crate) const RUN_EVENTS_TOPIC: &str = "events";

/// Run Coordinator (C5): owns the registry/bus/snapshot-store handles
/// shared by every run, plus per-run cancellation signals.
pub struct RunCoordinator {
    /// Committed workflow plans.
    pub registry: WorkflowRegistry,
    /// Event bus used for dispatch/result/lifecycle events.
    pub bus: Arc<dyn EventBus>,
    /// Durable snapshot store.
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Tunables (retry defaults, concurrency caps).
    pub config: CoordinatorConfig,
    abort_senders: DashMap<String, watch::Sender<bool>>,
    /// Bounds how many runs this coordinator drives to a stopping point at
    /// once; sized from `config.max_concurrent_runs`. `start`/`resume`/timer
    /// wakeups queue behind it rather than running unbounded.
    run_permits: Arc<tokio::sync::Semaphore>,
}

impl RunCoordinator {
    /// Build a new coordinator over the given registry/bus/store.
    pub fn new(
        registry: WorkflowRegistry,
        bus: Arc<dyn EventBus>,
        snapshots: Arc<dyn SnapshotStore>,
        config: CoordinatorConfig,
    ) -> Self {
        let run_permits = Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_runs.max(1)));
        Self { registry, bus, snapshots, config, abort_senders: DashMap::new(), run_permits }
    }

    fn abort_receiver(&self, run_id: &str) -> watch::Receiver<bool> {
        self.abort_senders
            .entry(run_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Idempotent run creation: returns the existing snapshot if `run_id`
    /// was already created, otherwise persists a fresh `Running` snapshot
    ///.
    pub async fn create_run(
        &self,
        wf_id: &str,
        run_id: &str,
        resource_id: Option<String>,
        input: Value,
    ) -> Result<RunSnapshot> {
        if let Some(existing) = self.snapshots.load(wf_id, run_id).await? {
            return Ok(existing);
        }
        let plan = self.registry.get(wf_id).map_err(|e| StepFlowError::Internal(e.to_string()))?;
        let now = Utc::now().timestamp_millis();
        let snapshot = RunSnapshot::new_running(wf_id, run_id, resource_id, input, plan.serialized_step_graph.clone(), now);
        self.snapshots.persist(wf_id, run_id, snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Drive the run from its current position to the next stopping point:
    /// success, failure, suspension, a parked timer, or (with `per_step`)
    /// a single-node pause.
    pub async fn run(
        self: &Arc<Self>,
        wf_id: &str,
        run_id: &str,
        request_context: serde_json::Map<String, Value>,
        per_step: bool,
    ) -> Result<RunSnapshot> {
        let plan = self.registry.get(wf_id).map_err(|e| StepFlowError::Internal(e.to_string()))?;
        let snapshot = self
            .snapshots
            .load(wf_id, run_id)
            .await?
            .ok_or_else(|| StepFlowError::InvalidRunState(format!("run not created: {run_id}")))?;

        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }

        let _permit = self.run_permits.clone().acquire_owned().await.expect("run permit semaphore not closed");
        let next_sequence = snapshot.last_sequence;
        let abort_rx = self.abort_receiver(run_id);
        let state = Arc::new(ExecState {
            coordinator: self.clone(),
            plan: plan.clone(),
            wf_id: wf_id.to_string(),
            run_id: run_id.to_string(),
            snapshot: Mutex::new(snapshot),
            request_context: Arc::new(request_context),
            abort_rx,
            // Continues the run's monotonic counter rather than restarting
            // at 0, which would collide with the bus's dedup-by-sequence on
            // every re-entry (resume/wake_timer) and silently drop events.
            sequence: AtomicU64::new(next_sequence),
            per_step,
        });
        state
            .publish(EventKind::RunStart {
                input: state.snapshot.lock().await.context.input.clone(),
                per_step,
                resume_data: None,
                request_context: state.request_context.as_ref().clone(),
            })
            .await;

        let outcome = state.run_root().await;
        let snapshot = self.finalize(&state, &outcome).await?;
        match outcome {
            Ok(_) => Ok(snapshot),
            Err(e) => Err(e),
        }
    }

    async fn run_nested(
        self: Arc<Self>,
        plan: Arc<Plan>,
        run_id: String,
        input: Value,
        request_context: Arc<serde_json::Map<String, Value>>,
        abort_rx: watch::Receiver<bool>,
    ) -> Result<NodeOutcome> {
        let now = Utc::now().timestamp_millis();
        let snapshot = RunSnapshot::new_running(&plan.id, &run_id, None, input, plan.serialized_step_graph.clone(), now);
        self.snapshots.persist(&plan.id, &run_id, snapshot.clone()).await?;

        let state = Arc::new(ExecState {
            coordinator: self.clone(),
            plan: plan.clone(),
            wf_id: plan.id.clone(),
            run_id,
            snapshot: Mutex::new(snapshot),
            request_context,
            abort_rx,
            sequence: AtomicU64::new(0),
            per_step: false,
        });

        let outcome = state.run_root().await;
        self.finalize(&state, &outcome).await?;
        outcome
    }

    /// Apply a run's final outcome to its snapshot, persist, and publish
    /// `run.finish`. Takes `outcome` by reference so callers that need the
    /// original `Result<NodeOutcome>` afterward (e.g. a sub-workflow
    /// propagating its outcome to its parent) keep ownership of it.
    async fn finalize(&self, state: &Arc<ExecState>, outcome: &Result<NodeOutcome>) -> Result<RunSnapshot> {
        let mut snapshot = state.snapshot.lock().await;
        if state.is_aborted() {
            // `cancel()` may have flipped the abort signal while a step that
            // ignores it ran to some other outcome; cancellation always wins
            // over whatever the traversal computed.
            snapshot.status = Status::Canceled;
        } else {
            match outcome {
                Ok(NodeOutcome::Value(v)) => {
                    snapshot.status = Status::Success;
                    snapshot.value = v.clone();
                }
                Ok(NodeOutcome::Bailed(v)) => {
                    snapshot.status = Status::Success;
                    snapshot.value = v.clone();
                }
                Ok(NodeOutcome::Suspended) => {
                    snapshot.status = Status::Suspended;
                }
                Ok(NodeOutcome::Sleeping) => {
                    snapshot.status = Status::Waiting;
                }
                Ok(NodeOutcome::Aborted) => {
                    snapshot.status = Status::Canceled;
                }
                Ok(NodeOutcome::Paused(v)) => {
                    snapshot.status = Status::Paused;
                    snapshot.value = v.clone();
                }
                Err(StepFlowError::StepFailure { error, .. }) => {
                    snapshot.status = Status::Failed;
                    snapshot.error = Some(error.clone());
                }
                Err(other) => {
                    snapshot.status = Status::Failed;
                    snapshot.error = Some(EncodedError::from_display(other));
                }
            }
        }
        snapshot.timestamp = Utc::now().timestamp_millis();
        let final_snapshot = snapshot.clone();
        drop(snapshot);

        self.snapshots.persist(&state.wf_id, &state.run_id, final_snapshot.clone()).await?;
        state
            .publish(EventKind::RunFinish {
                status: final_snapshot.status,
                result: if final_snapshot.status == Status::Success { Some(final_snapshot.value.clone()) } else { None },
                error: final_snapshot.error.clone(),
            })
            .await;

        Ok(final_snapshot)
    }

    /// Resume exactly one suspended label with `resume_data` and continue
    /// the run. A `/`-delimited label (`{sub_workflow_label}/{child_label}`)
    /// addresses a suspension nested inside a sub-workflow and is delegated
    /// to the child run instead of resolved against this run's own ledger.
    pub async fn resume(
        self: &Arc<Self>,
        wf_id: &str,
        run_id: &str,
        label: Option<String>,
        resume_data: Value,
        request_context: serde_json::Map<String, Value>,
        per_step: bool,
    ) -> Result<RunSnapshot> {
        if let Some(target) = &label {
            if let Some((head, rest)) = target.split_once('/') {
                return self
                    .resume_nested(wf_id, run_id, head, rest, resume_data, request_context, per_step)
                    .await;
            }
        }

        let mut snapshot = self
            .snapshots
            .load(wf_id, run_id)
            .await?
            .ok_or_else(|| StepFlowError::InvalidRunState(format!("run not created: {run_id}")))?;

        let target = match label {
            Some(label) => label,
            None => {
                let mut suspended: Vec<&String> = snapshot.suspended_paths.keys().collect();
                match suspended.len() {
                    1 => suspended.pop().unwrap().clone(),
                    0 => return Err(StepFlowError::ResumeTargetInvalid("no suspended steps".to_string())),
                    _ => return Err(StepFlowError::ResumeTargetInvalid("multiple suspended steps; label required".to_string())),
                }
            }
        };

        if !snapshot.suspended_paths.contains_key(&target) {
            return Err(StepFlowError::ResumeTargetInvalid(target));
        }

        let now = Utc::now().timestamp_millis();
        if let Some(result) = snapshot.context.steps.remove(&target) {
            snapshot.context.steps.insert(target.clone(), result.record_resume(resume_data.clone(), now));
        }
        snapshot.suspended_paths.remove(&target);
        snapshot.resume_labels.remove(&target);
        snapshot.status = Status::Running;
        self.snapshots.persist(wf_id, run_id, snapshot.clone()).await?;

        let _permit = self.run_permits.clone().acquire_owned().await.expect("run permit semaphore not closed");
        let plan = self.registry.get(wf_id).map_err(|e| StepFlowError::Internal(e.to_string()))?;
        let next_sequence = snapshot.last_sequence;
        let abort_rx = self.abort_receiver(run_id);
        let state = Arc::new(ExecState {
            coordinator: self.clone(),
            plan,
            wf_id: wf_id.to_string(),
            run_id: run_id.to_string(),
            snapshot: Mutex::new(snapshot),
            request_context: Arc::new(request_context),
            abort_rx,
            sequence: AtomicU64::new(next_sequence),
            per_step,
        });
        state
            .publish(EventKind::StepResume { label: target, resume_data })
            .await;

        let outcome = state.run_root().await;
        let snapshot = self.finalize(&state, &outcome).await?;
        match outcome {
            Ok(_) => Ok(snapshot),
            Err(e) => Err(e),
        }
    }

    /// Delegate a resume targeting a label nested inside the sub-workflow at
    /// `head` (in this run) down to the child run addressed by
    /// `{run_id}/{head}`, then reconcile this run's ledger once the child
    /// settles: on child success/failure, mark `head` settled here and
    /// continue this run from that point; while the child stays suspended,
    /// this run stays parked too.
    async fn resume_nested(
        self: &Arc<Self>,
        wf_id: &str,
        run_id: &str,
        head: &str,
        rest: &str,
        resume_data: Value,
        request_context: serde_json::Map<String, Value>,
        per_step: bool,
    ) -> Result<RunSnapshot> {
        let snapshot = self
            .snapshots
            .load(wf_id, run_id)
            .await?
            .ok_or_else(|| StepFlowError::InvalidRunState(format!("run not created: {run_id}")))?;
        if !snapshot.suspended_paths.contains_key(head) {
            return Err(StepFlowError::ResumeTargetInvalid(format!("{head}/{rest}")));
        }

        let plan = self.registry.get(wf_id).map_err(|e| StepFlowError::Internal(e.to_string()))?;
        let sub_workflow_id = match plan.find_node(head) {
            Some(GraphNode::SubWorkflow { workflow_id, .. }) => workflow_id.clone(),
            _ => return Err(StepFlowError::ResumeTargetInvalid(format!("{head}/{rest}"))),
        };
        let sub_run_id = format!("{run_id}/{head}");
        let child_target = if rest.is_empty() { None } else { Some(rest.to_string()) };

        let child_snapshot = Box::pin(self.resume(&sub_workflow_id, &sub_run_id, child_target, resume_data, request_context.clone(), false)).await?;

        if !child_snapshot.status.is_terminal() {
            return self
                .snapshots
                .load(wf_id, run_id)
                .await?
                .ok_or_else(|| StepFlowError::InvalidRunState(run_id.to_string()));
        }

        let mut snapshot = self
            .snapshots
            .load(wf_id, run_id)
            .await?
            .ok_or_else(|| StepFlowError::InvalidRunState(run_id.to_string()))?;
        let now = Utc::now().timestamp_millis();
        snapshot.suspended_paths.remove(head);
        snapshot.resume_labels.remove(head);
        snapshot.active_paths.retain(|p| p != head);

        if child_snapshot.status == Status::Success {
            if let Some(result) = snapshot.context.steps.remove(head) {
                snapshot.context.steps.insert(head.to_string(), result.succeed(child_snapshot.value.clone(), now));
            }
            snapshot.status = Status::Running;
            self.snapshots.persist(wf_id, run_id, snapshot).await?;
            self.run(wf_id, run_id, request_context, per_step).await
        } else {
            let error = child_snapshot
                .error
                .clone()
                .unwrap_or_else(|| EncodedError::new("SubWorkflowError", "sub-workflow did not reach a successful outcome"));
            if let Some(result) = snapshot.context.steps.remove(head) {
                snapshot.context.steps.insert(head.to_string(), result.fail(error.clone(), now));
            }
            snapshot.status = Status::Failed;
            snapshot.error = Some(error.clone());
            self.snapshots.persist(wf_id, run_id, snapshot.clone()).await?;
            Err(StepFlowError::StepFailure { label: head.to_string(), error })
        }
    }

    /// Transition a parked timer to success and continue the run (called by
    /// the scheduler once a `waiting_paths` entry is due).
    pub async fn wake_timer(self: &Arc<Self>, wf_id: &str, run_id: &str, label: &str) -> Result<RunSnapshot> {
        let plan = self.registry.get(wf_id).map_err(|e| StepFlowError::Internal(e.to_string()))?;
        let snapshot = self
            .snapshots
            .load(wf_id, run_id)
            .await?
            .ok_or_else(|| StepFlowError::InvalidRunState(format!("run not created: {run_id}")))?;

        let _permit = self.run_permits.clone().acquire_owned().await.expect("run permit semaphore not closed");
        let next_sequence = snapshot.last_sequence;
        let abort_rx = self.abort_receiver(run_id);
        let state = Arc::new(ExecState {
            coordinator: self.clone(),
            plan,
            wf_id: wf_id.to_string(),
            run_id: run_id.to_string(),
            snapshot: Mutex::new(snapshot),
            request_context: Arc::new(serde_json::Map::new()),
            abort_rx,
            sequence: AtomicU64::new(next_sequence),
            per_step: false,
        });
        state.publish(EventKind::TimerFire { label: label.to_string() }).await;

        let outcome = state.run_root().await;
        let snapshot = self.finalize(&state, &outcome).await?;
        match outcome {
            Ok(_) => Ok(snapshot),
            Err(e) => Err(e),
        }
    }

    /// Request cancellation: flips the run's abort signal so in-flight and
    /// future steps observe it and return `abort()` promptly.
    pub async fn cancel(&self, wf_id: &str, run_id: &str) -> Result<()> {
        if let Some(sender) = self.abort_senders.get(run_id) {
            let _ = sender.send(true);
        } else {
            let (tx, _rx) = watch::channel(true);
            self.abort_senders.insert(run_id.to_string(), tx);
        }
        // `cancel` runs outside any `ExecState`, so it has no run-local
        // sequence counter to share; it borrows the top of the u64 range so
        // it can never collide with a real run's monotonically-increasing
        // event sequence.
        self.bus
            .publish(
                &Topic::run(run_id, RUN_EVENTS_TOPIC),
                EventEnvelope::new(run_id, wf_id, u64::MAX - 1, EventKind::RunCancel),
            )
            .await;

        if let Some(mut snapshot) = self.snapshots.load(wf_id, run_id).await? {
            if !snapshot.status.is_terminal() {
                snapshot.status = Status::Canceled;
                snapshot.timestamp = Utc::now().timestamp_millis();
                // Same sentinel as the bus events above: a run still
                // in-flight when `cancel` lands will eventually call
                // `finalize`, whose own persist must never be able to
                // clobber this one under the store's last-writer-wins rule.
                snapshot.last_sequence = u64::MAX - 1;
                self.snapshots.persist(wf_id, run_id, snapshot).await?;
            }
        }
        self.bus
            .publish(
                &Topic::run(run_id, RUN_EVENTS_TOPIC),
                EventEnvelope::new(run_id, wf_id, u64::MAX, EventKind::RunCanceled),
            )
            .await;
        Ok(())
    }

    /// Roll a run's visible state back to just after `target_label`
    /// completed, discarding every later step result, so a subsequent
    /// `run()` replays forward from that point with new inputs. This is a structural rewind of the persisted
    /// ledger, not a re-execution of history.
    pub async fn time_travel(&self, wf_id: &str, run_id: &str, target_label: &str) -> Result<RunSnapshot> {
        let mut snapshot = self
            .snapshots
            .load(wf_id, run_id)
            .await?
            .ok_or_else(|| StepFlowError::InvalidRunState(format!("run not created: {run_id}")))?;

        let target = snapshot
            .context
            .steps
            .get(target_label)
            .cloned()
            .ok_or_else(|| StepFlowError::TimeTravelInvalid(format!("no such label: {target_label}")))?;
        let target_started_at = target.started_at;

        snapshot.context.steps.retain(|_, result| result.started_at <= target_started_at);
        snapshot.active_paths.clear();
        snapshot.suspended_paths.clear();
        snapshot.waiting_paths.clear();
        snapshot.retry_count.clear();
        snapshot.status = Status::Running;
        snapshot.value = target.output.clone().unwrap_or(target.payload.clone());
        snapshot.timestamp = Utc::now().timestamp_millis();

        self.snapshots.persist(wf_id, run_id, snapshot.clone()).await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::graph::{Schema, Step, StepOutcome, WorkflowBuilder};
    use crate::snapshot::InMemorySnapshotStore;
    use serde_json::json;

    fn build_coordinator() -> (Arc<RunCoordinator>, WorkflowRegistry) {
        let registry = WorkflowRegistry::new();
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::default());
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
        let coordinator = Arc::new(RunCoordinator::new(registry.clone(), bus, snapshots, CoordinatorConfig::default()));
        (coordinator, registry)
    }

    fn echo_step(id: &str) -> Step {
        let id_owned = id.to_string();
        Step {
            id: id.to_string(),
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            suspend_schema: None,
            resume_schema: None,
            retry_policy: None,
            execute: Arc::new(move |ctx| {
                let id_owned = id_owned.clone();
                Box::pin(async move {
                    let mut out = ctx.input_data.clone();
                    if let Value::Object(map) = &mut out {
                        map.insert("visited".to_string(), json!(id_owned));
                    }
                    Ok(StepOutcome::Success(out))
                })
            }),
        }
    }

    #[tokio::test]
    async fn runs_a_two_step_sequence_to_success() {
        let (coordinator, registry) = build_coordinator();
        let mut builder = WorkflowBuilder::new("wf-1");
        let a = builder.step(echo_step("a"));
        let b = builder.step(echo_step("b"));
        builder.then(a).then(b);
        registry.register(builder.commit().unwrap()).unwrap();

        coordinator.create_run("wf-1", "run-1", None, json!({})).await.unwrap();
        let snapshot = coordinator.run("wf-1", "run-1", serde_json::Map::new(), false).await.unwrap();

        assert_eq!(snapshot.status, Status::Success);
        assert_eq!(snapshot.value, json!({"visited": "b"}));
        assert_eq!(snapshot.context.steps.len(), 2);
    }

    #[tokio::test]
    async fn suspends_and_resumes_with_payload() {
        let (coordinator, registry) = build_coordinator();
        let mut builder = WorkflowBuilder::new("wf-suspend");
        let suspending = Step {
            id: "ask".to_string(),
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            suspend_schema: None,
            resume_schema: None,
            retry_policy: None,
            execute: Arc::new(|ctx| {
                Box::pin(async move {
                    if let Some(resume) = ctx.resume_data.clone() {
                        Ok(StepOutcome::Success(resume))
                    } else {
                        Ok(StepOutcome::Suspend(json!({"need": "approval"})))
                    }
                })
            }),
        };
        let node = builder.step(suspending);
        builder.then(node);
        registry.register(builder.commit().unwrap()).unwrap();

        coordinator.create_run("wf-suspend", "run-1", None, json!({})).await.unwrap();
        let snapshot = coordinator.run("wf-suspend", "run-1", serde_json::Map::new(), false).await.unwrap();
        assert_eq!(snapshot.status, Status::Suspended);
        assert!(snapshot.suspended_paths.contains_key("ask"));

        let resumed = coordinator
            .resume("wf-suspend", "run-1", Some("ask".to_string()), json!({"approved": true}), serde_json::Map::new(), false)
            .await
            .unwrap();
        assert_eq!(resumed.status, Status::Success);
        assert_eq!(resumed.value, json!({"approved": true}));
    }

    #[tokio::test]
    async fn retries_exhaust_into_a_terminal_failure() {
        let (coordinator, registry) = build_coordinator();
        let mut builder = WorkflowBuilder::new("wf-retry");
        let failing = Step {
            id: "always_fails".to_string(),
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            suspend_schema: None,
            resume_schema: None,
            retry_policy: Some(RetryPolicy { attempts: 2, delay_ms: 1, backoff_multiplier: None }),
            execute: Arc::new(|_ctx| Box::pin(async { Err(EncodedError::new("Boom", "always fails")) })),
        };
        let node = builder.step(failing);
        builder.then(node);
        registry.register(builder.commit().unwrap()).unwrap();

        coordinator.create_run("wf-retry", "run-1", None, json!({})).await.unwrap();
        let result = coordinator.run("wf-retry", "run-1", serde_json::Map::new(), false).await;
        assert!(result.is_err());

        let snapshot = coordinator.snapshots.load("wf-retry", "run-1").await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::Failed);
        assert_eq!(snapshot.retry_count.get("always_fails"), Some(&2));
    }

    #[tokio::test]
    async fn create_run_is_idempotent_by_run_id() {
        let (coordinator, registry) = build_coordinator();
        let mut builder = WorkflowBuilder::new("wf-idem");
        let node = builder.step(echo_step("only"));
        builder.then(node);
        registry.register(builder.commit().unwrap()).unwrap();

        let first = coordinator.create_run("wf-idem", "run-1", None, json!({"x": 1})).await.unwrap();
        let second = coordinator.create_run("wf-idem", "run-1", None, json!({"x": 2})).await.unwrap();
        assert_eq!(first.context.input, second.context.input);
    }

    #[tokio::test]
    async fn foreach_runs_with_bounded_concurrency() {
        let (coordinator, registry) = build_coordinator();
        let mut builder = WorkflowBuilder::new("wf-foreach");
        let inner = builder.step(echo_step("item"));
        let foreach = builder.node_foreach(inner, ForeachOptions { concurrency: 2 });
        builder.then(foreach);
        registry.register(builder.commit().unwrap()).unwrap();

        coordinator.create_run("wf-foreach", "run-1", None, json!([{"a": 1}, {"b": 2}, {"c": 3}])).await.unwrap();
        let snapshot = coordinator.run("wf-foreach", "run-1", serde_json::Map::new(), false).await.unwrap();

        assert_eq!(snapshot.status, Status::Success);
        assert_eq!(snapshot.value.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn per_step_pauses_after_one_node_then_resumes_to_success() {
        let (coordinator, registry) = build_coordinator();
        let mut builder = WorkflowBuilder::new("wf-perstep");
        let a = builder.step(echo_step("a"));
        let b = builder.step(echo_step("b"));
        builder.then(a).then(b);
        registry.register(builder.commit().unwrap()).unwrap();

        coordinator.create_run("wf-perstep", "run-1", None, json!({})).await.unwrap();
        let paused = coordinator.run("wf-perstep", "run-1", serde_json::Map::new(), true).await.unwrap();
        assert_eq!(paused.status, Status::Paused);
        assert_eq!(paused.context.steps.len(), 1);

        let finished = coordinator.run("wf-perstep", "run-1", serde_json::Map::new(), true).await.unwrap();
        assert_eq!(finished.status, Status::Paused);
        assert_eq!(finished.context.steps.len(), 2);
        assert_eq!(finished.value, json!({"visited": "b"}));
    }

    #[tokio::test]
    async fn suspend_payload_carries_workflow_meta_and_populates_resume_labels() {
        let (coordinator, registry) = build_coordinator();
        let mut builder = WorkflowBuilder::new("wf-meta");
        let suspending = Step {
            id: "ask".to_string(),
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            suspend_schema: None,
            resume_schema: None,
            retry_policy: None,
            execute: Arc::new(|ctx| {
                Box::pin(async move {
                    if let Some(resume) = ctx.resume_data.clone() {
                        Ok(StepOutcome::Success(resume))
                    } else {
                        Ok(StepOutcome::Suspend(json!({"need": "approval"})))
                    }
                })
            }),
        };
        let node = builder.step(suspending);
        builder.then(node);
        registry.register(builder.commit().unwrap()).unwrap();

        coordinator.create_run("wf-meta", "run-1", None, json!({})).await.unwrap();
        let snapshot = coordinator.run("wf-meta", "run-1", serde_json::Map::new(), false).await.unwrap();

        assert_eq!(snapshot.status, Status::Suspended);
        let meta = snapshot.resume_labels.get("ask").expect("resume_labels populated on suspend");
        assert_eq!(meta["path"], json!(["ask"]));
        assert_eq!(meta["runId"], json!("run-1"));

        let suspend_payload = snapshot.context.steps["ask"].suspend_payload.clone().unwrap();
        assert_eq!(suspend_payload["need"], json!("approval"));
        assert_eq!(suspend_payload["__workflow_meta"]["path"], json!(["ask"]));
        assert_eq!(suspend_payload["__workflow_meta"]["runId"], json!("run-1"));
    }

    #[tokio::test]
    async fn cancel_overrides_a_step_that_ignores_the_abort_signal() {
        let (coordinator, registry) = build_coordinator();
        let mut builder = WorkflowBuilder::new("wf-cancel");
        let ignores_abort = Step {
            id: "slow".to_string(),
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            suspend_schema: None,
            resume_schema: None,
            retry_policy: None,
            execute: Arc::new(|_ctx| {
                Box::pin(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok(StepOutcome::Success(json!({"done": true})))
                })
            }),
        };
        let node = builder.step(ignores_abort);
        builder.then(node);
        registry.register(builder.commit().unwrap()).unwrap();

        coordinator.create_run("wf-cancel", "run-1", None, json!({})).await.unwrap();

        let running = coordinator.clone();
        let handle = tokio::spawn(async move { running.run("wf-cancel", "run-1", serde_json::Map::new(), false).await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        coordinator.cancel("wf-cancel", "run-1").await.unwrap();
        let _ = handle.await.unwrap();

        let snapshot = coordinator.snapshots.load("wf-cancel", "run-1").await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::Canceled);
    }
}
