//! In-memory event bus.
//!
//! Per-subscriber `tokio::mpsc` channels, registered in a map keyed by
//! topic and guarded by a `tokio::sync::RwLock`. A topic can have multiple
//! subscribers; a `(run_id, sequence)` dedup set ensures a subscriber never
//! observes the same event twice even across a duplicate publish.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::{mpsc, RwLock};

use super::{EventBus, EventEnvelope, Subscription, Topic};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;

/// In-memory, single-process implementation of [`EventBus`].
///
/// Suitable for tests and for single-instance deployments; durability across
/// process restarts is the snapshot store's job (C2), not the bus's.
pub struct InMemoryBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<EventEnvelope>>>>,
    seen: Arc<DashSet<(String, u64)>>,
}

impl InMemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            seen: Arc::new(DashSet::new()),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

struct MpscSubscription {
    rx: mpsc::Receiver<EventEnvelope>,
}

#[async_trait]
impl Subscription for MpscSubscription {
    async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, topic: &Topic, event: EventEnvelope) {
        // At-least-once + idempotent-by-sequence: a duplicate publish of an
        // already-seen (run_id, sequence) pair is dropped rather than
        // re-delivered.
        let key = (event.run_id.clone(), event.sequence);
        if !self.seen.insert(key) {
            return;
        }

        let subscribers = self.subscribers.read().await;
        if let Some(senders) = subscribers.get(&topic.0) {
            for sender in senders {
                // Publication never fails for the caller; a full or closed
                // subscriber channel is logged and skipped, not propagated.
                if sender.try_send(event.clone()).is_err() {
                    tracing::warn!(topic = %topic, "dropping event for a lagging or closed subscriber");
                }
            }
        }
    }

    async fn subscribe(&self, topic: &Topic) -> Box<dyn Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut subscribers = self.subscribers.write().await;
        subscribers.entry(topic.0.clone()).or_default().push(tx);
        Box::new(MpscSubscription { rx })
    }
}
