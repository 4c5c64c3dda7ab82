//! Workflow Registry (C6): resolves workflow ids to committed plans.
//!
//! A concurrent `DashMap` keyed by workflow id, read far more often than
//! written — the same pattern used by the in-memory bus and snapshot store.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::graph::Plan;

/// Errors raised while registering or resolving workflows.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No committed plan is registered under this id.
    #[error("workflow not registered: {0}")]
    NotFound(String),
    /// A plan with this id is already registered.
    #[error("workflow already registered: {0}")]
    AlreadyRegistered(String),
}

/// A concurrent registry of committed workflow plans.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    plans: Arc<DashMap<String, Arc<Plan>>>,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly committed plan under its own id.
    pub fn register(&self, plan: Plan) -> Result<(), RegistryError> {
        let id = plan.id.clone();
        if self.plans.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        self.plans.insert(id, Arc::new(plan));
        Ok(())
    }

    /// Register a plan, replacing any existing registration under the same
    /// id. Used for redeploys in tests/tooling; production callers should
    /// prefer [`Self::register`] and a new workflow id for a changed plan.
    pub fn register_replacing(&self, plan: Plan) {
        self.plans.insert(plan.id.clone(), Arc::new(plan));
    }

    /// Look up a committed plan by id.
    pub fn get(&self, workflow_id: &str) -> Result<Arc<Plan>, RegistryError> {
        self.plans
            .get(workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(workflow_id.to_string()))
    }

    /// `true` if a plan is registered under this id.
    pub fn contains(&self, workflow_id: &str) -> bool {
        self.plans.contains_key(workflow_id)
    }

    /// Register a clone of an existing plan under a new id.
    pub fn clone_workflow(&self, workflow_id: &str, new_id: impl Into<String>) -> Result<Arc<Plan>, RegistryError> {
        let source = self.get(workflow_id)?;
        let new_id = new_id.into();
        if self.plans.contains_key(&new_id) {
            return Err(RegistryError::AlreadyRegistered(new_id));
        }
        let cloned = Arc::new(source.clone_as(new_id.clone()));
        self.plans.insert(new_id, cloned.clone());
        Ok(cloned)
    }

    /// List every registered workflow id.
    pub fn ids(&self) -> Vec<String> {
        self.plans.iter().map(|entry| entry.key().clone()).collect()
    }
}
