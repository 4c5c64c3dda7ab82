//! Coordinator configuration.
//!
//! A plain struct with a `Default` impl, constructed in code rather than
//! parsed from env/file.

use crate::graph::RetryPolicy;

/// Tunables for a [`crate::coordinator::RunCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Applied to any step that doesn't declare its own [`RetryPolicy`].
    pub default_retry: RetryPolicy,
    /// Upper bound on concurrently dispatched timer wakeups the
    /// [`crate::scheduler::Scheduler`] hands to the coordinator per poll
    /// tick; `0` sizes it to the host's core count instead. Unrelated to
    /// concurrency inside a single `parallel`/`foreach` node — `parallel`
    /// always runs every child at once, and `foreach` is bounded by its own
    /// `options.concurrency` instead.
    pub dispatch_concurrency: usize,
    /// How often the scheduler checks the timer heap for due wakeups.
    pub timer_poll_interval_ms: u64,
    /// Maximum number of runs a single coordinator will execute at once;
    /// additional `start`/`resume` calls queue behind a semaphore.
    pub max_concurrent_runs: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            dispatch_concurrency: 16,
            timer_poll_interval_ms: 250,
            max_concurrent_runs: 256,
        }
    }
}
