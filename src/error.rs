//! Crate-wide error types and the structural error codec (C9).
//!
//! A single `thiserror` enum wraps the per-module error enums via `#[from]`.
//! User step errors are never passed across the bus/snapshot boundary as
//! native Rust values — they are always round-tripped through
//! [`EncodedError`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::bus::BusError;
use crate::graph::GraphError;
use crate::snapshot::SnapshotError;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, StepFlowError>;

/// Top-level error taxonomy.
#[derive(Error, Debug)]
pub enum StepFlowError {
    /// Schema failure on step input or run input when `validate_inputs` is set.
    #[error("input validation failed for {label}: {message}")]
    InputValidation {
        /// Absolute label of the node whose input failed validation.
        label: String,
        /// Human-readable cause.
        message: String,
    },

    /// `start` called on a plan lacking `.commit()`.
    #[error("workflow plan has not been committed")]
    UncommittedPlan,

    /// No nodes were added to the plan before `commit()`.
    #[error("workflow plan is empty")]
    EmptyPlan,

    /// A removed combinator (`waitForEvent`) was referenced.
    #[error("unsupported operator `{0}`: use suspend/resume instead")]
    UnsupportedOperator(String),

    /// `restart()` is not supported in the durable/evented execution model.
    #[error("restart is not supported; use resume or timeTravel")]
    RestartNotSupported,

    /// `timeTravel` target could not be resolved, or the run is still active.
    #[error("time travel target invalid: {0}")]
    TimeTravelInvalid(String),

    /// A user step threw after exhausting its retry policy.
    #[error("step `{label}` failed: {error}")]
    StepFailure {
        /// Absolute label of the failed step.
        label: String,
        /// Encoded error, round-tripped through the error codec.
        error: EncodedError,
    },

    /// `resume` addressed a label that is not currently suspended.
    #[error("resume target invalid: {0}")]
    ResumeTargetInvalid(String),

    /// Run is in a terminal or otherwise inapplicable state for the call.
    #[error("invalid run state: {0}")]
    InvalidRunState(String),

    /// Event bus failure.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Snapshot store failure.
    #[error("snapshot store error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Graph construction/validation failure.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Serialization boundary failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else; kept narrow and rare.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A structurally encoded error: `{name, message, ownProps, stack?, cause?}`.
///
/// Built so that a thrown error's identity survives any number of bus or
/// snapshot round-trips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodedError {
    /// Error type name (e.g. `"Error"`, `"TypeError"`, a custom name).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Enumerable own properties beyond name/message/stack/cause.
    #[serde(default)]
    pub own_props: HashMap<String, Value>,
    /// Optional captured stack trace text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Recursive cause chain, boxed to keep the type finite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<EncodedError>>,
    /// Set when the cause chain was truncated at [`MAX_CAUSE_DEPTH`].
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// Safe recursion bound for `cause` chains.
pub const MAX_CAUSE_DEPTH: usize = 16;

impl EncodedError {
    /// Build an encoded error from parts, without a cause.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            own_props: HashMap::new(),
            stack: None,
            cause: None,
            truncated: false,
        }
    }

    /// Attach an own property.
    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.own_props.insert(key.into(), value);
        self
    }

    /// Attach a cause, respecting [`MAX_CAUSE_DEPTH`].
    pub fn with_cause(mut self, cause: EncodedError) -> Self {
        if cause.depth() + 1 > MAX_CAUSE_DEPTH {
            self.truncated = true;
        } else {
            self.truncated = self.truncated || cause.truncated;
            self.cause = Some(Box::new(cause));
        }
        self
    }

    fn depth(&self) -> usize {
        1 + self.cause.as_deref().map_or(0, EncodedError::depth)
    }

    /// Encode a plain Rust error (no structured cause chain available) as a
    /// leaf `EncodedError`, preserving its `Display` message under `name`
    /// `"Error"`. Callers that already have name/message/own-props (e.g. a
    /// step's declared failure) should construct `EncodedError` directly
    /// instead of going through this generic path.
    pub fn from_display(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut encoded = Self::new("Error", err.to_string());
        if let Some(source) = err.source() {
            encoded = encoded.with_cause(Self::from_display(source));
        }
        encoded
    }
}

impl std::fmt::Display for EncodedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for EncodedError {}
