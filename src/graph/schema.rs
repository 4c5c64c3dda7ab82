//! Pluggable input/output validators.
//!
//! The teacher validates state against a hand-rolled `StateValidator`
//! (`state::schema`) rather than a general JSON-schema engine; this crate
//! follows the same shape — a small closure-based validator — since the
//! spec takes no position on schema representation and a query/validation
//! language is explicitly out of scope.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// A validator over a [`serde_json::Value`], returning `Err(message)` on
/// failure.
#[derive(Clone)]
pub struct Schema(Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>);

impl Schema {
    /// Build a schema from a validation closure.
    pub fn new(validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(validator))
    }

    /// A schema that accepts any value (the default for steps that don't
    /// declare one).
    pub fn any() -> Self {
        Self::new(|_| Ok(()))
    }

    /// Require the value to be a JSON object.
    pub fn object() -> Self {
        Self::new(|v| {
            if v.is_object() {
                Ok(())
            } else {
                Err("expected a JSON object".to_string())
            }
        })
    }

    /// Run the validator.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        (self.0)(value)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").finish_non_exhaustive()
    }
}
