//! Workflow Registry / Builder (C6): fluent plan construction.
//!
//! A mutable builder accumulates nodes before a terminal `commit()`, using a
//! `&mut self -> &mut Self` chain so `.then(...).parallel(...).commit()`
//! reads fluently without consuming the builder on every call.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};

use super::{BranchArm, ForeachOptions, GraphError, GraphNode, MapSpec, RetryPolicy, Schema, Step};

/// An async predicate over the current value, used by `branch`/`do_until`/
/// `do_while`.
pub type Predicate = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, bool> + Send + Sync>;

/// Per-workflow options.
#[derive(Clone)]
pub struct WorkflowOptions {
    /// Whether step/run input is validated against declared schemas.
    pub validate_inputs: bool,
    /// Invoked with the final snapshot projection on success or failure.
    pub on_finish: Option<Arc<dyn Fn(serde_json::Value) + Send + Sync>>,
    /// Invoked with `{error, steps}` when the run fails.
    pub on_error: Option<Arc<dyn Fn(serde_json::Value) + Send + Sync>>,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            validate_inputs: true,
            on_finish: None,
            on_error: None,
        }
    }
}

/// Builder for a workflow plan.
pub struct WorkflowBuilder {
    id: String,
    input_schema: Schema,
    output_schema: Schema,
    retry_config: Option<RetryPolicy>,
    options: WorkflowOptions,
    steps: HashMap<String, Step>,
    nodes: Vec<GraphNode>,
    next_id: usize,
    legacy_operator: Option<String>,
    committed: bool,
}

impl WorkflowBuilder {
    /// Start building a new plan.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            retry_config: None,
            options: WorkflowOptions::default(),
            steps: HashMap::new(),
            nodes: Vec::new(),
            next_id: 0,
            legacy_operator: None,
            committed: false,
        }
    }

    /// Set the run input schema.
    pub fn input_schema(&mut self, schema: Schema) -> &mut Self {
        self.input_schema = schema;
        self
    }

    /// Set the run output schema.
    pub fn output_schema(&mut self, schema: Schema) -> &mut Self {
        self.output_schema = schema;
        self
    }

    /// Set a workflow-level default retry policy (overridden per-step).
    pub fn retry_config(&mut self, policy: RetryPolicy) -> &mut Self {
        self.retry_config = Some(policy);
        self
    }

    /// Set workflow options (`validateInputs`, `onFinish`, `onError`).
    pub fn options(&mut self, options: WorkflowOptions) -> &mut Self {
        self.options = options;
        self
    }

    fn gensym(&mut self, kind: &str) -> String {
        let label = format!("__{kind}_{}", self.next_id);
        self.next_id += 1;
        label
    }

    /// Register a step, producing a standalone node referencing it. The
    /// returned node can be appended directly via [`Self::then`] or nested
    /// inside a combinator built from another `node_*` call.
    pub fn step(&mut self, step: Step) -> GraphNode {
        let id = step.id.clone();
        self.steps.insert(id.clone(), step);
        GraphNode::Step { label: id.clone(), step_id: id }
    }

    /// Build (without appending) a `parallel` node over the given children.
    pub fn node_parallel(&mut self, children: Vec<GraphNode>) -> GraphNode {
        let label = self.gensym("parallel");
        GraphNode::Parallel { label, children }
    }

    /// Build (without appending) a `branch` node over the given arms.
    pub fn node_branch(&mut self, arms: Vec<(String, Predicate, GraphNode)>) -> GraphNode {
        let label = self.gensym("branch");
        let arms = arms
            .into_iter()
            .map(|(label, predicate, node)| BranchArm { label, predicate, node: Box::new(node) })
            .collect();
        GraphNode::Branch { label, arms }
    }

    /// Build a `do_until` node.
    pub fn node_do_until(&mut self, node: GraphNode, predicate: Predicate) -> GraphNode {
        let label = self.gensym("do_until");
        GraphNode::DoUntil { label, node: Box::new(node), predicate }
    }

    /// Build a `do_while` node.
    pub fn node_do_while(&mut self, node: GraphNode, predicate: Predicate) -> GraphNode {
        let label = self.gensym("do_while");
        GraphNode::DoWhile { label, node: Box::new(node), predicate }
    }

    /// Build a `foreach` node.
    pub fn node_foreach(&mut self, node: GraphNode, options: ForeachOptions) -> GraphNode {
        let label = self.gensym("foreach");
        GraphNode::Foreach { label, node: Box::new(node), options }
    }

    /// Build a `map` node.
    pub fn node_map(&mut self, spec: MapSpec) -> GraphNode {
        let label = self.gensym("map");
        GraphNode::Map { label, spec }
    }

    /// Build a `sleep` node.
    pub fn node_sleep(&mut self, delay_ms: u64) -> GraphNode {
        let label = self.gensym("sleep");
        GraphNode::Sleep { label, delay_ms }
    }

    /// Build a `sleep_until` node.
    pub fn node_sleep_until(&mut self, wake_at: i64) -> GraphNode {
        let label = self.gensym("sleep_until");
        GraphNode::SleepUntil { label, wake_at }
    }

    /// Build a `sub_workflow` node embedding another committed plan.
    pub fn node_sub_workflow(&mut self, workflow_id: impl Into<String>) -> GraphNode {
        let label = self.gensym("sub_workflow");
        GraphNode::SubWorkflow { label, workflow_id: workflow_id.into() }
    }

    /// Append a node to the root sequence.
    pub fn then(&mut self, node: GraphNode) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Append a `parallel` node to the root sequence.
    pub fn parallel(&mut self, children: Vec<GraphNode>) -> &mut Self {
        let node = self.node_parallel(children);
        self.then(node)
    }

    /// Append a `branch` node to the root sequence.
    pub fn branch(&mut self, arms: Vec<(String, Predicate, GraphNode)>) -> &mut Self {
        let node = self.node_branch(arms);
        self.then(node)
    }

    /// Append a `do_until` node to the root sequence.
    pub fn do_until(&mut self, node: GraphNode, predicate: Predicate) -> &mut Self {
        let node = self.node_do_until(node, predicate);
        self.then(node)
    }

    /// Append a `do_while` node to the root sequence.
    pub fn do_while(&mut self, node: GraphNode, predicate: Predicate) -> &mut Self {
        let node = self.node_do_while(node, predicate);
        self.then(node)
    }

    /// Append a `foreach` node to the root sequence.
    pub fn foreach(&mut self, node: GraphNode, options: ForeachOptions) -> &mut Self {
        let node = self.node_foreach(node, options);
        self.then(node)
    }

    /// Append a `map` node to the root sequence.
    pub fn map(&mut self, spec: MapSpec) -> &mut Self {
        let node = self.node_map(spec);
        self.then(node)
    }

    /// Append a `sleep` node to the root sequence.
    pub fn sleep(&mut self, delay_ms: u64) -> &mut Self {
        let node = self.node_sleep(delay_ms);
        self.then(node)
    }

    /// Append a `sleep_until` node to the root sequence.
    pub fn sleep_until(&mut self, wake_at: i64) -> &mut Self {
        let node = self.node_sleep_until(wake_at);
        self.then(node)
    }

    /// Reference the removed `waitForEvent` operator; always rejected at
    /// `commit()` with [`GraphError::UnsupportedOperator`].
    pub fn wait_for_event(&mut self) -> &mut Self {
        self.legacy_operator = Some("waitForEvent".to_string());
        self
    }

    /// Freeze the plan: validates structure, rejects legacy operators, and
    /// computes the deterministic `serializedStepGraph` fingerprint.
    pub fn commit(&mut self) -> Result<Plan, GraphError> {
        if let Some(op) = &self.legacy_operator {
            return Err(GraphError::UnsupportedOperator(format!(
                "`{op}` was removed; use suspend/resume instead"
            )));
        }
        if self.nodes.is_empty() {
            return Err(GraphError::EmptyPlan);
        }

        let serialized_step_graph = fingerprint(&self.nodes);
        self.committed = true;

        Ok(Plan {
            id: self.id.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
            retry_config: self.retry_config.clone(),
            options: self.options.clone(),
            steps: self.steps.clone(),
            nodes: self.nodes.clone(),
            serialized_step_graph,
            committed: true,
        })
    }
}

/// A frozen, immutable workflow plan.
#[derive(Clone)]
pub struct Plan {
    /// The workflow's registry id.
    pub id: String,
    /// Run input schema.
    pub input_schema: Schema,
    /// Run output schema.
    pub output_schema: Schema,
    /// Workflow-level default retry policy.
    pub retry_config: Option<RetryPolicy>,
    /// Workflow options.
    pub options: WorkflowOptions,
    /// Registered steps, by id.
    pub steps: HashMap<String, Step>,
    /// The root-level node sequence.
    pub nodes: Vec<GraphNode>,
    /// Structural fingerprint, stable for the life of the plan.
    pub serialized_step_graph: serde_json::Value,
    /// Always `true`; plans are only ever constructed via `commit()`.
    pub committed: bool,
}

impl Plan {
    /// Look up a registered step by id.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }

    /// Find a node anywhere in the plan by its absolute label.
    pub fn find_node(&self, label: &str) -> Option<&GraphNode> {
        fn search<'a>(nodes: &'a [GraphNode], label: &str) -> Option<&'a GraphNode> {
            for node in nodes {
                if node.label() == label {
                    return Some(node);
                }
                let found = match node {
                    GraphNode::Parallel { children, .. } => search(children, label),
                    GraphNode::Branch { arms, .. } => {
                        arms.iter().find_map(|arm| search(std::slice::from_ref(arm.node.as_ref()), label))
                    }
                    GraphNode::DoUntil { node, .. }
                    | GraphNode::DoWhile { node, .. }
                    | GraphNode::Foreach { node, .. } => search(std::slice::from_ref(node.as_ref()), label),
                    _ => None,
                };
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        search(&self.nodes, label)
    }

    /// Produce a new, distinct plan with the same node/step structure under
    /// a new registry id.
    pub fn clone_as(&self, new_id: impl Into<String>) -> Plan {
        Plan {
            id: new_id.into(),
            ..self.clone()
        }
    }
}

/// Build a deterministic structural fingerprint of a node sequence.
///
/// Hashes a canonical JSON shadow of the plan (kind, label, and nesting —
/// never the step closures themselves, which aren't serializable) so that
/// resume/time-travel can detect a plan that changed shape since a run
/// started.
fn fingerprint(nodes: &[GraphNode]) -> serde_json::Value {
    fn shadow(node: &GraphNode) -> serde_json::Value {
        use serde_json::json;
        match node {
            GraphNode::Step { label, step_id } => json!({"kind": "step", "label": label, "step_id": step_id}),
            GraphNode::Parallel { label, children } => {
                json!({"kind": "parallel", "label": label, "children": children.iter().map(shadow).collect::<Vec<_>>()})
            }
            GraphNode::Branch { label, arms } => json!({
                "kind": "branch",
                "label": label,
                "arms": arms.iter().map(|a| json!({"label": a.label, "node": shadow(&a.node)})).collect::<Vec<_>>(),
            }),
            GraphNode::DoUntil { label, node, .. } => json!({"kind": "do_until", "label": label, "node": shadow(node)}),
            GraphNode::DoWhile { label, node, .. } => json!({"kind": "do_while", "label": label, "node": shadow(node)}),
            GraphNode::Foreach { label, node, options } => json!({
                "kind": "foreach", "label": label, "node": shadow(node), "concurrency": options.concurrency,
            }),
            GraphNode::Sleep { label, delay_ms } => json!({"kind": "sleep", "label": label, "delay_ms": delay_ms}),
            GraphNode::SleepUntil { label, wake_at } => json!({"kind": "sleep_until", "label": label, "wake_at": wake_at}),
            GraphNode::Map { label, .. } => json!({"kind": "map", "label": label}),
            GraphNode::SubWorkflow { label, workflow_id } => json!({"kind": "sub_workflow", "label": label, "workflow_id": workflow_id}),
        }
    }

    let shadow_tree: Vec<serde_json::Value> = nodes.iter().map(shadow).collect();
    let canonical = serde_json::to_string(&shadow_tree).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    serde_json::json!({
        "fingerprint": format!("{digest:x}"),
        "node_count": nodes.len(),
    })
}
