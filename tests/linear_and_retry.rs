//! Black-box coverage of a linear two-step run and retry exhaustion,
//! driven only through the public `stepflow` API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use stepflow::{
    CoordinatorConfig, EncodedError, InMemoryBus, InMemorySnapshotStore, RunCoordinator, Schema,
    Status, Step, StepOutcome, WorkflowBuilder, WorkflowRegistry,
};

fn new_coordinator() -> (Arc<RunCoordinator>, WorkflowRegistry) {
    let registry = WorkflowRegistry::new();
    let bus: Arc<dyn stepflow::EventBus> = Arc::new(InMemoryBus::default());
    let snapshots: Arc<dyn stepflow::SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
    let coordinator = Arc::new(RunCoordinator::new(registry.clone(), bus, snapshots, CoordinatorConfig::default()));
    (coordinator, registry)
}

fn add_one_step(id: &str) -> Step {
    Step {
        id: id.to_string(),
        input_schema: Schema::any(),
        output_schema: Schema::any(),
        suspend_schema: None,
        resume_schema: None,
        retry_policy: None,
        execute: Arc::new(|ctx| {
            Box::pin(async move {
                let n = ctx.input_data.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(StepOutcome::Success(json!({"n": n + 1})))
            })
        }),
    }
}

#[tokio::test]
async fn two_steps_run_in_order_to_success() {
    let (coordinator, registry) = new_coordinator();
    let mut builder = WorkflowBuilder::new("wf-linear");
    let a = builder.step(add_one_step("a"));
    let b = builder.step(add_one_step("b"));
    builder.then(a).then(b);
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-linear", "run-1", None, json!({"n": 0})).await.unwrap();
    let snapshot = coordinator.run("wf-linear", "run-1", serde_json::Map::new(), false).await.unwrap();

    assert_eq!(snapshot.status, Status::Success);
    assert_eq!(snapshot.value, json!({"n": 2}));
    assert_eq!(snapshot.context.steps.len(), 2);
    assert!(snapshot.context.steps.contains_key("a"));
    assert!(snapshot.context.steps.contains_key("b"));
}

#[tokio::test]
async fn exhausted_retries_fail_the_run_and_persist_the_error() {
    let (coordinator, registry) = new_coordinator();
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let flaky = Step {
        id: "flaky".to_string(),
        input_schema: Schema::any(),
        output_schema: Schema::any(),
        suspend_schema: None,
        resume_schema: None,
        retry_policy: Some(stepflow::graph::RetryPolicy { attempts: 2, delay_ms: 1, backoff_multiplier: None }),
        execute: Arc::new(move |_ctx| {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Err(EncodedError::new("BoomError", "always fails")) })
        }),
    };

    let mut builder = WorkflowBuilder::new("wf-retry");
    let f = builder.step(flaky);
    builder.then(f);
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-retry", "run-1", None, json!({})).await.unwrap();
    let result = coordinator.run("wf-retry", "run-1", serde_json::Map::new(), false).await;
    assert!(result.is_err());

    // One initial attempt plus two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let snapshot = coordinator.snapshots.load("wf-retry", "run-1").await.unwrap().unwrap();
    assert_eq!(snapshot.status, Status::Failed);
    assert!(snapshot.error.is_some());
    assert_eq!(snapshot.error.as_ref().unwrap().name, "BoomError");
}
