//! Black-box coverage of a timer-parked run woken by the [`Scheduler`].

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use stepflow::{CoordinatorConfig, InMemoryBus, InMemorySnapshotStore, RunCoordinator, Scheduler, Schema, Status, Step, StepOutcome, WorkflowBuilder, WorkflowRegistry};

fn new_coordinator() -> (Arc<RunCoordinator>, WorkflowRegistry) {
    let registry = WorkflowRegistry::new();
    let bus: Arc<dyn stepflow::EventBus> = Arc::new(InMemoryBus::default());
    let snapshots: Arc<dyn stepflow::SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
    let coordinator = Arc::new(RunCoordinator::new(registry.clone(), bus, snapshots, CoordinatorConfig::default()));
    (coordinator, registry)
}

fn echo_step(id: &str) -> Step {
    Step {
        id: id.to_string(),
        input_schema: Schema::any(),
        output_schema: Schema::any(),
        suspend_schema: None,
        resume_schema: None,
        retry_policy: None,
        execute: Arc::new(|ctx| Box::pin(async move { Ok(StepOutcome::Success(ctx.input_data.clone())) })),
    }
}

#[tokio::test]
async fn a_run_parked_on_sleep_is_woken_by_the_scheduler() {
    let (coordinator, registry) = new_coordinator();
    let mut builder = WorkflowBuilder::new("wf-sleep");
    builder.sleep(1);
    let after = builder.step(echo_step("after"));
    builder.then(after);
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-sleep", "run-1", None, json!({"ok": true})).await.unwrap();
    let parked = coordinator.run("wf-sleep", "run-1", serde_json::Map::new(), false).await.unwrap();
    assert_eq!(parked.status, Status::Waiting);
    assert_eq!(parked.waiting_paths.len(), 1);

    tokio::time::sleep(Duration::from_millis(5)).await;

    let scheduler = Scheduler::new(coordinator.clone());
    scheduler.scan_and_wake().await.unwrap();

    let snapshot = coordinator.snapshots.load("wf-sleep", "run-1").await.unwrap().unwrap();
    assert_eq!(snapshot.status, Status::Success);
    assert_eq!(snapshot.value, json!({"ok": true}));
}

#[tokio::test]
async fn scheduler_scan_is_a_no_op_when_nothing_is_due() {
    let (coordinator, registry) = new_coordinator();
    let mut builder = WorkflowBuilder::new("wf-sleep-long");
    builder.sleep(60_000);
    let after = builder.step(echo_step("after"));
    builder.then(after);
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-sleep-long", "run-1", None, json!({})).await.unwrap();
    coordinator.run("wf-sleep-long", "run-1", serde_json::Map::new(), false).await.unwrap();

    let scheduler = Scheduler::new(coordinator.clone());
    scheduler.scan_and_wake().await.unwrap();

    let snapshot = coordinator.snapshots.load("wf-sleep-long", "run-1").await.unwrap().unwrap();
    assert_eq!(snapshot.status, Status::Waiting);
}
