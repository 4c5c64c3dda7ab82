//! In-memory snapshot store.
//!
//! A `DashMap` keyed by identity plus a secondary index for listing, with
//! last-writer-wins semantics: a `persist` carrying an older `last_sequence`
//! than what's already stored is silently dropped.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ListFilter, RunSnapshot, SnapshotError, SnapshotStore};

/// In-memory implementation of [`SnapshotStore`], suitable for tests and
/// single-process deployments that don't need restart durability.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    // keyed by (wf_id, run_id)
    snapshots: Arc<DashMap<(String, String), RunSnapshot>>,
    // wf_id -> ordered run_ids, oldest first
    by_workflow: Arc<DashMap<String, Vec<String>>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn persist(&self, wf_id: &str, run_id: &str, snapshot: RunSnapshot) -> Result<(), SnapshotError> {
        let key = (wf_id.to_string(), run_id.to_string());
        if let Some(existing) = self.snapshots.get(&key) {
            if existing.last_sequence > snapshot.last_sequence {
                // Stale write from a slower coordinator; last-writer-wins by
                // sequence number, so this write is dropped, not applied.
                return Ok(());
            }
        } else {
            self.by_workflow
                .entry(wf_id.to_string())
                .or_insert_with(Vec::new)
                .push(run_id.to_string());
        }
        self.snapshots.insert(key, snapshot);
        Ok(())
    }

    async fn load(&self, wf_id: &str, run_id: &str) -> Result<Option<RunSnapshot>, SnapshotError> {
        Ok(self
            .snapshots
            .get(&(wf_id.to_string(), run_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn list(&self, wf_id: &str, filter: ListFilter) -> Result<(Vec<RunSnapshot>, usize), SnapshotError> {
        let run_ids = self
            .by_workflow
            .get(wf_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        let mut matched: Vec<RunSnapshot> = run_ids
            .into_iter()
            .filter_map(|run_id| self.snapshots.get(&(wf_id.to_string(), run_id)).map(|e| e.value().clone()))
            .filter(|snap| {
                filter.resource_id.as_deref().map_or(true, |rid| snap.resource_id.as_deref() == Some(rid))
                    && filter.status.map_or(true, |s| std::mem::discriminant(&s) == std::mem::discriminant(&snap.status))
            })
            .collect();

        let total = matched.len();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok((matched, total))
    }

    async fn clear_all(&self, wf_id: &str) -> Result<(), SnapshotError> {
        if let Some((_, run_ids)) = self.by_workflow.remove(wf_id) {
            for run_id in run_ids {
                self.snapshots.remove(&(wf_id.to_string(), run_id));
            }
        }
        Ok(())
    }
}
