//! Subscription registry: caller intent to receive messages per topic.

use std::collections::HashMap;

use crate::types::MessageHandler;

pub(crate) struct SubscriptionEntry {
    pub topic: String,
    pub handler: MessageHandler,
}

/// Live subscriptions keyed by identifier. Entries survive transient
/// reconnects; they are removed only by `unsubscribe` or a caller-initiated
/// disconnect.
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionEntry>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Record a subscription and return its identifier ("sub-0", "sub-1",
    /// ...), unique for the lifetime of this registry.
    pub fn register(&mut self, topic: String, handler: MessageHandler) -> String {
        let id = format!("sub-{}", self.next_id);
        self.next_id += 1;
        self.entries
            .insert(id.clone(), SubscriptionEntry { topic, handler });
        id
    }

    /// Remove by identifier. Returns whether an entry was present; removing
    /// twice is a no-op.
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Handlers currently subscribed to `topic`, cloned out so dispatch can
    /// run them without holding the registry lock.
    pub fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.entries
            .values()
            .filter(|e| e.topic == topic)
            .map(|e| e.handler.clone())
            .collect()
    }

    /// (id, topic) pairs to reissue after a reconnect. Order is unspecified.
    pub fn replay_set(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.topic.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
