//! Step Runtime (C4): the execution context handed to every step invocation.
//!
//! A per-node bag of run identity, prior results, and abort plumbing handed
//! into every node executor, extended with the resume data and request
//! context a step body needs to make resume-aware decisions.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::graph::StepOutcome;
use crate::snapshot::StepResult;

/// The value handed to every step function.
///
/// A step function is `Fn(ExecutionContext) -> BoxFuture<Result<StepOutcome,
/// EncodedError>>`: it reads whatever it needs off the context, then returns
/// one of the `ctx.success/suspend/bail` outcomes, e.g. `return
/// Ok(ctx.suspend(payload))`.
#[derive(Clone)]
pub struct ExecutionContext {
    /// The step's resolved input (either the run's init data for the first
    /// step, or the upstream node's output/mapped value).
    pub input_data: Value,
    /// Present only when this invocation resumes a previously suspended
    /// step.
    pub resume_data: Option<Value>,
    /// Zero on first attempt; incremented on each retry.
    pub retry_count: u32,
    /// The run this step is executing under.
    pub run_id: String,
    /// Caller-supplied context passed through from `createRun`/`start`.
    pub request_context: Arc<serde_json::Map<String, Value>>,
    /// The run's original input, available to every step regardless of
    /// position.
    init_data: Value,
    /// Completed results of every step run so far in this run, keyed by
    /// label.
    prior_results: Arc<HashMap<String, StepResult>>,
    /// Cooperative cancellation signal; steps should poll this and return
    /// `ctx.abort()` promptly once it flips.
    abort_signal: watch::Receiver<bool>,
}

impl ExecutionContext {
    /// Build a context for a single step invocation.
    pub fn new(
        input_data: Value,
        resume_data: Option<Value>,
        retry_count: u32,
        run_id: impl Into<String>,
        request_context: Arc<serde_json::Map<String, Value>>,
        init_data: Value,
        prior_results: Arc<HashMap<String, StepResult>>,
        abort_signal: watch::Receiver<bool>,
    ) -> Self {
        Self {
            input_data,
            resume_data,
            retry_count,
            run_id: run_id.into(),
            request_context,
            init_data,
            prior_results,
            abort_signal,
        }
    }

    /// The run's original input, regardless of this step's position in the
    /// graph.
    pub fn get_init_data(&self) -> &Value {
        &self.init_data
    }

    /// Look up a previously completed step's result by label.
    pub fn get_step_result(&self, label: &str) -> Option<&StepResult> {
        self.prior_results.get(label)
    }

    /// `true` once the run has been asked to cancel.
    pub fn is_aborted(&self) -> bool {
        *self.abort_signal.borrow()
    }

    /// Resolve once the run is asked to cancel; steps awaiting long
    /// operations can race this against their own work.
    pub async fn aborted(&mut self) {
        let _ = self.abort_signal.changed().await;
    }

    /// Produce a normal success outcome.
    pub fn success(&self, output: Value) -> StepOutcome {
        StepOutcome::Success(output)
    }

    /// Produce a suspend outcome carrying `payload` for the caller to act on
    /// before resuming.
    pub fn suspend(&self, payload: Value) -> StepOutcome {
        StepOutcome::Suspend(payload)
    }

    /// Produce a bail outcome: the whole run succeeds immediately with
    /// `output`, skipping any remaining nodes.
    pub fn bail(&self, output: Value) -> StepOutcome {
        StepOutcome::Bail(output)
    }

    /// Produce an abort outcome in response to cancellation.
    pub fn abort(&self) -> StepOutcome {
        StepOutcome::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(input: Value) -> ExecutionContext {
        let (_tx, rx) = watch::channel(false);
        ExecutionContext::new(
            input,
            None,
            0,
            "run-1",
            Arc::new(serde_json::Map::new()),
            json!({"initial": true}),
            Arc::new(HashMap::new()),
            rx,
        )
    }

    #[test]
    fn get_init_data_is_stable_regardless_of_input() {
        let context = ctx(json!({"step": "input"}));
        assert_eq!(context.get_init_data(), &json!({"initial": true}));
    }

    #[test]
    fn outcome_helpers_build_expected_variants() {
        let context = ctx(json!(null));
        assert!(matches!(context.success(json!(1)), StepOutcome::Success(_)));
        assert!(matches!(context.suspend(json!(1)), StepOutcome::Suspend(_)));
        assert!(matches!(context.bail(json!(1)), StepOutcome::Bail(_)));
        assert!(matches!(context.abort(), StepOutcome::Abort));
    }

    #[tokio::test]
    async fn abort_signal_resolves_once_flipped() {
        let (tx, rx) = watch::channel(false);
        let mut context = ExecutionContext::new(
            json!(null),
            None,
            0,
            "run-1",
            Arc::new(serde_json::Map::new()),
            json!(null),
            Arc::new(HashMap::new()),
            rx,
        );
        assert!(!context.is_aborted());
        tx.send(true).unwrap();
        context.aborted().await;
        assert!(context.is_aborted());
    }
}
