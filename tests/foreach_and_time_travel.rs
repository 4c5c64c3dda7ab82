//! Black-box coverage of bounded-concurrency `forEach` and `timeTravel`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use stepflow::graph::ForeachOptions;
use stepflow::{CoordinatorConfig, InMemoryBus, InMemorySnapshotStore, RunCoordinator, Schema, Status, Step, StepOutcome, WorkflowBuilder, WorkflowRegistry};

fn new_coordinator() -> (Arc<RunCoordinator>, WorkflowRegistry) {
    let registry = WorkflowRegistry::new();
    let bus: Arc<dyn stepflow::EventBus> = Arc::new(InMemoryBus::default());
    let snapshots: Arc<dyn stepflow::SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
    let coordinator = Arc::new(RunCoordinator::new(registry.clone(), bus, snapshots, CoordinatorConfig::default()));
    (coordinator, registry)
}

#[tokio::test]
async fn foreach_never_exceeds_its_configured_concurrency() {
    let (coordinator, registry) = new_coordinator();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let in_flight_clone = in_flight.clone();
    let max_observed_clone = max_observed.clone();

    let double = Step {
        id: "double".to_string(),
        input_schema: Schema::any(),
        output_schema: Schema::any(),
        suspend_schema: None,
        resume_schema: None,
        retry_policy: None,
        execute: Arc::new(move |ctx| {
            let in_flight = in_flight_clone.clone();
            let max_observed = max_observed_clone.clone();
            Box::pin(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                let n = ctx.input_data.as_i64().unwrap_or(0);
                Ok(StepOutcome::Success(json!(n * 2)))
            })
        }),
    };

    let mut builder = WorkflowBuilder::new("wf-foreach");
    let child = builder.step(double);
    builder.foreach(child, ForeachOptions { concurrency: 2 });
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-foreach", "run-1", None, json!([1, 2, 3, 4, 5])).await.unwrap();
    let snapshot = coordinator.run("wf-foreach", "run-1", serde_json::Map::new(), false).await.unwrap();

    assert_eq!(snapshot.status, Status::Success);
    assert_eq!(snapshot.value, json!([2, 4, 6, 8, 10]));
    assert!(max_observed.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn time_travel_rewinds_to_a_target_label_and_drops_later_history() {
    let (coordinator, registry) = new_coordinator();

    fn pass_through(id: &str) -> Step {
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

    let mut builder = WorkflowBuilder::new("wf-time-travel");
    let a = builder.step(pass_through("a"));
    let b = builder.step(pass_through("b"));
    let c = builder.step(pass_through("c"));
    builder.then(a).then(b).then(c);
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-time-travel", "run-1", None, json!("start")).await.unwrap();
    let finished = coordinator.run("wf-time-travel", "run-1", serde_json::Map::new(), false).await.unwrap();
    assert_eq!(finished.status, Status::Success);
    assert_eq!(finished.context.steps.len(), 3);

    let rewound = coordinator.time_travel("wf-time-travel", "run-1", "a").await.unwrap();
    assert_eq!(rewound.status, Status::Running);
    assert_eq!(rewound.context.steps.len(), 1);
    assert!(rewound.context.steps.contains_key("a"));
    assert!(!rewound.context.steps.contains_key("b"));

    let replayed = coordinator.run("wf-time-travel", "run-1", serde_json::Map::new(), false).await.unwrap();
    assert_eq!(replayed.status, Status::Success);
    assert_eq!(replayed.context.steps.len(), 3);
}

#[tokio::test]
async fn time_travel_rejects_an_unknown_label() {
    let (coordinator, registry) = new_coordinator();
    let mut builder = WorkflowBuilder::new("wf-time-travel-bad");
    let a = builder.step(Step {
        id: "a".to_string(),
        input_schema: Schema::any(),
        output_schema: Schema::any(),
        suspend_schema: None,
        resume_schema: None,
        retry_policy: None,
        execute: Arc::new(|ctx| Box::pin(async move { Ok(StepOutcome::Success(ctx.input_data.clone())) })),
    });
    builder.then(a);
    registry.register(builder.commit().unwrap()).unwrap();

    coordinator.create_run("wf-time-travel-bad", "run-1", None, json!({})).await.unwrap();
    coordinator.run("wf-time-travel-bad", "run-1", serde_json::Map::new(), false).await.unwrap();

    let result = coordinator.time_travel("wf-time-travel-bad", "run-1", "nope").await;
    assert!(result.is_err());
}
