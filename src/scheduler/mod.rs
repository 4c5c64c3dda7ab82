//! Scheduler (C8): timer wakeups and per-run serialization.
//!
//! A background loop polls on an interval: list every `Waiting` run across
//! every registered workflow, wake the ones whose `waiting_paths` entry is
//! due, and bound how many wake dispatches run concurrently with a
//! semaphore.
//!
//! Step dispatch itself isn't queued through here: `RunCoordinator::run`
//! invokes a step's executor in-process as soon as it's reached, so the
//! only asynchronous work this module schedules is timer wakeups. A single
//! run's coordinator work is still serialized — `run_lock` hands out one
//! mutex per run id so a scheduler-driven `wake_timer` never races a
//! concurrently in-flight `start`/`resume` for the same run.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, warn};

use crate::coordinator::RunCoordinator;
use crate::error::Result;
use crate::registry::WorkflowRegistry;
use crate::snapshot::{ListFilter, Status};

/// Background timer-wake loop over every workflow in a [`WorkflowRegistry`].
pub struct Scheduler {
    coordinator: Arc<RunCoordinator>,
    registry: WorkflowRegistry,
    poll_interval: Duration,
    dispatch_semaphore: Arc<Semaphore>,
    run_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Scheduler {
    /// Build a scheduler over `coordinator`'s registry, using its configured
    /// poll interval and dispatch concurrency.
    pub fn new(coordinator: Arc<RunCoordinator>) -> Self {
        let registry = coordinator.registry.clone();
        let poll_interval = Duration::from_millis(coordinator.config.timer_poll_interval_ms);
        // 0 means "size to the host": a scheduler on an otherwise-idle
        // instance can afford one wake dispatch per core.
        let configured = coordinator.config.dispatch_concurrency;
        let concurrency = if configured == 0 { num_cpus::get() } else { configured };
        let dispatch_semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        Self { coordinator, registry, poll_interval, dispatch_semaphore, run_locks: DashMap::new() }
    }

    fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.run_locks.entry(run_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Spawn the poll loop as a background task. Drop the returned shutdown
    /// sender (or send `true`) to stop it.
    pub fn spawn(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self;
        let handle = tokio::spawn(async move {
            loop {
                if let Err(error) = scheduler.scan_and_wake().await {
                    warn!(%error, "scheduler tick failed");
                }
                // A few ms of jitter keeps a fleet of coordinators sharing one
                // snapshot store from all polling in lockstep.
                let jitter_ms = rand::thread_rng().gen_range(0..=20);
                tokio::select! {
                    _ = tokio::time::sleep(scheduler.poll_interval + Duration::from_millis(jitter_ms)) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }

    /// One scan across every registered workflow: list its `Waiting` runs,
    /// and wake any whose timer is due. Called both on a timer by
    /// [`Self::spawn`]'s loop and directly on startup (the first tick scans
    /// and fires anything that elapsed while the process was down).
    pub async fn scan_and_wake(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut wakeups = Vec::new();

        for wf_id in self.registry.ids() {
            let (waiting_runs, _total) = self
                .coordinator
                .snapshots
                .list(&wf_id, ListFilter { status: Some(Status::Waiting), ..Default::default() })
                .await?;

            for snapshot in waiting_runs {
                for (label, wake_at) in &snapshot.waiting_paths {
                    if *wake_at <= now {
                        wakeups.push((wf_id.clone(), snapshot.run_id.clone(), label.clone()));
                    }
                }
            }
        }

        let futures = wakeups.into_iter().map(|(wf_id, run_id, label)| {
            let semaphore = self.dispatch_semaphore.clone();
            let lock = self.run_lock(&run_id);
            let coordinator = self.coordinator.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                let _run_guard = lock.lock().await;
                debug!(%wf_id, %run_id, %label, "waking due timer");
                if let Err(error) = coordinator.wake_timer(&wf_id, &run_id, &label).await {
                    warn!(%wf_id, %run_id, %label, %error, "timer wakeup failed");
                }
            }
        });
        join_all(futures).await;
        Ok(())
    }
}
