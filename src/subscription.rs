//! Exact-topic subscription registry.
//!
//! Topics are opaque strings compared for equality, so the store is a pair
//! of hash maps rather than a topic trie: a forward index from topic to
//! subscriber set, and a reverse index from connection to its topics so
//! disconnect cleanup does not scan every topic.
//!
//! Invariant: a connection appears in `subscribers[topic]` exactly when
//! `topic` appears in `client_topics[connection]`.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use mio::Token;

use crate::client_handle::ClientWriteHandle;

/// Registry identity for one connection: (worker id, poll token). Tokens
/// are never reused within a worker, so a stale key cannot collide with a
/// live connection.
pub type SubscriberKey = (usize, Token);

pub struct SubscriptionStore {
    /// topic -> connections subscribed under exactly that string.
    subscribers: AHashMap<String, AHashMap<SubscriberKey, Arc<ClientWriteHandle>>>,
    /// Reverse index for cleanup: connection -> topics.
    client_topics: AHashMap<SubscriberKey, AHashSet<String>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            subscribers: AHashMap::new(),
            client_topics: AHashMap::new(),
        }
    }

    /// Register `handle` under `topic`. Idempotent.
    pub fn subscribe(&mut self, topic: &str, handle: Arc<ClientWriteHandle>) {
        let key = handle.key();
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .insert(key, handle);
        self.client_topics
            .entry(key)
            .or_default()
            .insert(topic.to_string());
    }

    /// Remove `key` from every topic it is subscribed to and drop its
    /// reverse entry. Emptied topic sets are removed entirely.
    pub fn unsubscribe_all(&mut self, key: SubscriberKey) {
        let Some(topics) = self.client_topics.remove(&key) else {
            return;
        };

        for topic in topics {
            if let Some(subs) = self.subscribers.get_mut(&topic) {
                subs.remove(&key);
                if subs.is_empty() {
                    self.subscribers.remove(&topic);
                }
            }
        }
    }

    /// Point-in-time copy of the subscriber set for `topic`. The broadcast
    /// iterates the copy, so concurrent subscribe/unsubscribe cannot corrupt
    /// or block an in-flight fanout. No ordering guarantee.
    pub fn fanout(&self, topic: &str) -> Vec<Arc<ClientWriteHandle>> {
        match self.subscribers.get(topic) {
            Some(subs) => subs.values().cloned().collect(),
            None => Vec::new(),
        }
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_handle(worker_id: usize, id: usize) -> Arc<ClientWriteHandle> {
        // Dummy fds; no I/O happens in these tests.
        Arc::new(ClientWriteHandle::new(worker_id, -1, id as i32, Token(id)))
    }

    /// Both directions of the index agree.
    fn check_invariant(store: &SubscriptionStore) {
        for (topic, subs) in &store.subscribers {
            assert!(!subs.is_empty(), "empty topic set left behind: {}", topic);
            for key in subs.keys() {
                assert!(store.client_topics[key].contains(topic));
            }
        }
        for (key, topics) in &store.client_topics {
            for topic in topics {
                assert!(store.subscribers[topic].contains_key(key));
            }
        }
    }

    #[test]
    fn exact_match_only() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/b", make_handle(0, 1));

        assert_eq!(store.fanout("a/b").len(), 1);
        assert!(store.fanout("a/b/c").is_empty());
        assert!(store.fanout("a").is_empty());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut store = SubscriptionStore::new();
        let h = make_handle(0, 1);
        store.subscribe("t", h.clone());
        store.subscribe("t", h);

        assert_eq!(store.fanout("t").len(), 1);
        assert_eq!(store.client_topics[&(0, Token(1))].len(), 1);
        check_invariant(&store);
    }

    #[test]
    fn unsubscribe_all_clears_both_indexes() {
        let mut store = SubscriptionStore::new();
        let h1 = make_handle(0, 1);
        let h2 = make_handle(1, 2);
        store.subscribe("x", h1.clone());
        store.subscribe("y", h1.clone());
        store.subscribe("x", h2);

        store.unsubscribe_all(h1.key());

        assert_eq!(store.fanout("x").len(), 1);
        assert!(store.fanout("y").is_empty());
        assert!(!store.client_topics.contains_key(&h1.key()));
        // The emptied "y" entry must be gone, not left as an empty set.
        assert!(!store.subscribers.contains_key("y"));
        check_invariant(&store);
    }

    #[test]
    fn unsubscribe_all_unknown_key_is_a_noop() {
        let mut store = SubscriptionStore::new();
        store.subscribe("t", make_handle(0, 1));
        store.unsubscribe_all((7, Token(99)));
        assert_eq!(store.fanout("t").len(), 1);
        check_invariant(&store);
    }

    #[test]
    fn invariant_holds_over_mixed_sequence() {
        let mut store = SubscriptionStore::new();
        let handles: Vec<_> = (0..4).map(|i| make_handle(i % 2, i)).collect();

        for (i, h) in handles.iter().enumerate() {
            store.subscribe("shared", h.clone());
            store.subscribe(&format!("own/{}", i), h.clone());
        }
        check_invariant(&store);

        store.unsubscribe_all(handles[1].key());
        store.unsubscribe_all(handles[3].key());
        check_invariant(&store);

        assert_eq!(store.fanout("shared").len(), 2);
        assert!(store.fanout("own/1").is_empty());
        assert_eq!(store.fanout("own/2").len(), 1);

        store.subscribe("shared", handles[1].clone());
        check_invariant(&store);
        assert_eq!(store.fanout("shared").len(), 3);
    }

    #[test]
    fn fanout_snapshot_survives_registry_changes() {
        let mut store = SubscriptionStore::new();
        let h = make_handle(0, 1);
        store.subscribe("t", h.clone());

        let snapshot = store.fanout("t");
        store.unsubscribe_all(h.key());

        // The in-flight copy is unaffected by the removal.
        assert_eq!(snapshot.len(), 1);
        assert!(store.fanout("t").is_empty());
    }
}
