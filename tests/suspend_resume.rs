//! Black-box coverage of suspend/resume and cancellation.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use stepflow::{CoordinatorConfig, InMemoryBus, InMemorySnapshotStore, RunCoordinator, Schema, Status, Step, StepOutcome, WorkflowBuilder, WorkflowRegistry};

fn new_coordinator() -> (Arc<RunCoordinator>, WorkflowRegistry) {
    let registry = WorkflowRegistry::new();
    let bus: Arc<dyn stepflow::EventBus> = Arc::new(InMemoryBus::default());
    let snapshots: Arc<dyn stepflow::SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
    let coordinator = Arc::new(RunCoordinator::new(registry.clone(), bus, snapshots, CoordinatorConfig::default()));
    (coordinator, registry)
}

fn approval_step() -> Step {
    Step {
        id: "approval".to_string(),
        input_schema: Schema::any(),
        output_schema: Schema::any(),
        suspend_schema: None,
        resume_schema: None,
        retry_policy: None,
        execute: Arc::new(|ctx| {
            Box::pin(async move {
                if let Some(resume) = ctx.resume_data {
                    return Ok(StepOutcome::Success(json!({"approved": resume})));
                }
                Ok(StepOutcome::Suspend(json!({"question": "approve?"})))
            })
        }),
    }
}

#[tokio::test]
async fn a_suspended_step_resumes_with_supplied_data() {
    let (coordinator, registry) = new_coordinator();
    let mut builder = WorkflowBuilder::new("wf-suspend");
    let a = builder.step(approval_step());
    builder.then(a);
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-suspend", "run-1", None, json!({})).await.unwrap();
    let suspended = coordinator.run("wf-suspend", "run-1", serde_json::Map::new(), false).await.unwrap();
    assert_eq!(suspended.status, Status::Suspended);
    assert!(suspended.suspended_paths.contains_key("approval"));

    let resumed = coordinator
        .resume("wf-suspend", "run-1", None, json!(true), serde_json::Map::new(), false)
        .await
        .unwrap();

    assert_eq!(resumed.status, Status::Success);
    assert_eq!(resumed.value, json!({"approved": true}));
    assert!(resumed.suspended_paths.is_empty());
}

#[tokio::test]
async fn resume_with_an_unknown_label_is_rejected() {
    let (coordinator, registry) = new_coordinator();
    let mut builder = WorkflowBuilder::new("wf-suspend-bad-label");
    let a = builder.step(approval_step());
    builder.then(a);
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-suspend-bad-label", "run-1", None, json!({})).await.unwrap();
    coordinator.run("wf-suspend-bad-label", "run-1", serde_json::Map::new(), false).await.unwrap();

    let result = coordinator
        .resume("wf-suspend-bad-label", "run-1", Some("not-a-real-label".to_string()), json!(true), serde_json::Map::new(), false)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn cancel_marks_a_running_run_canceled() {
    let (coordinator, registry) = new_coordinator();
    let mut builder = WorkflowBuilder::new("wf-cancel");
    let a = builder.step(approval_step());
    builder.then(a);
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-cancel", "run-1", None, json!({})).await.unwrap();
    coordinator.run("wf-cancel", "run-1", serde_json::Map::new(), false).await.unwrap();

    coordinator.cancel("wf-cancel", "run-1").await.unwrap();

    // Once suspended/terminal-pending, cancel still flips a non-terminal
    // snapshot's status, since the run hadn't reached Success/Failed/Canceled.
    let snapshot = coordinator.snapshots.load("wf-cancel", "run-1").await.unwrap().unwrap();
    assert_eq!(snapshot.status, Status::Canceled);
}
