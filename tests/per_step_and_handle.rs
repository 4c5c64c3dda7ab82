//! Black-box coverage of `perStep` pausing and the [`WorkflowHandle`]/
//! [`RunHandle`] surface.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use stepflow::{CoordinatorConfig, InMemoryBus, InMemorySnapshotStore, ListFilter, RunCoordinator, Schema, Status, Step, StepOutcome, WorkflowBuilder, WorkflowHandle, WorkflowRegistry};

fn new_coordinator() -> (Arc<RunCoordinator>, WorkflowRegistry) {
    let registry = WorkflowRegistry::new();
    let bus: Arc<dyn stepflow::EventBus> = Arc::new(InMemoryBus::default());
    let snapshots: Arc<dyn stepflow::SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
    let coordinator = Arc::new(RunCoordinator::new(registry.clone(), bus, snapshots, CoordinatorConfig::default()));
    (coordinator, registry)
}

fn tag_step(id: &str) -> Step {
    Step {
        id: id.to_string(),
        input_schema: Schema::any(),
        output_schema: Schema::any(),
        suspend_schema: None,
        resume_schema: None,
        retry_policy: None,
        execute: Arc::new(|_ctx| {
            let id = "done";
            Box::pin(async move { Ok(StepOutcome::Success(json!({"step": id}))) })
        }),
    }
}

#[tokio::test]
async fn per_step_advances_one_node_per_call_until_success() {
    let (coordinator, registry) = new_coordinator();
    let mut builder = WorkflowBuilder::new("wf-per-step");
    let a = builder.step(tag_step("a"));
    let b = builder.step(tag_step("b"));
    let c = builder.step(tag_step("c"));
    builder.then(a).then(b).then(c);
    registry.register(builder.commit().unwrap()).unwrap();

    let workflow = WorkflowHandle::new(coordinator, "wf-per-step");
    let run = workflow.create_run("run-1", None, json!({})).await.unwrap();

    let first = run.start(serde_json::Map::new(), true).await.unwrap();
    assert_eq!(first.status, Status::Paused);
    assert_eq!(first.context.steps.len(), 1);

    let second = run.start(serde_json::Map::new(), true).await.unwrap();
    assert_eq!(second.status, Status::Paused);
    assert_eq!(second.context.steps.len(), 2);

    let third = run.start(serde_json::Map::new(), true).await.unwrap();
    assert_eq!(third.status, Status::Success);
    assert_eq!(third.context.steps.len(), 3);
}

#[tokio::test]
async fn workflow_handle_lists_and_fetches_runs_by_resource_id() {
    let (coordinator, registry) = new_coordinator();
    let mut builder = WorkflowBuilder::new("wf-handle-list");
    let a = builder.step(tag_step("a"));
    builder.then(a);
    registry.register(builder.commit().unwrap()).unwrap();

    let workflow = WorkflowHandle::new(coordinator, "wf-handle-list");
    let run_a = workflow.create_run("run-a", Some("tenant-1".to_string()), json!({})).await.unwrap();
    let run_b = workflow.create_run("run-b", Some("tenant-2".to_string()), json!({})).await.unwrap();
    run_a.start(serde_json::Map::new(), false).await.unwrap();
    run_b.start(serde_json::Map::new(), false).await.unwrap();

    let (all_runs, total) = workflow.list_workflow_runs(ListFilter::default()).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(all_runs.len(), 2);

    let filtered = ListFilter { resource_id: Some("tenant-1".to_string()), ..Default::default() };
    let (tenant_runs, tenant_total) = workflow.list_workflow_runs(filtered).await.unwrap();
    assert_eq!(tenant_total, 1);
    assert_eq!(tenant_runs[0].run_id, "run-a");

    let fetched = workflow.get_workflow_run_by_id("run-b").await.unwrap().unwrap();
    assert_eq!(fetched.status, Status::Success);
}
