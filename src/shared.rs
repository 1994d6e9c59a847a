//! State shared across worker threads.
//!
//! Exactly two things are shared mutably: the subscription registry and the
//! metrics collector. Both are constructed once at startup and passed by
//! `Arc` into the accept loop, every worker, and the HTTP exporter; there
//! is no ambient global state.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::metrics::BrokerMetrics;
use crate::subscription::SubscriptionStore;

pub struct SharedState {
    /// Exact-topic subscription registry (read on fanout, write on
    /// subscribe/disconnect).
    pub subscriptions: RwLock<SubscriptionStore>,
    /// Atomic counters and latency aggregates; not behind the lock.
    pub metrics: BrokerMetrics,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(SubscriptionStore::new()),
            metrics: BrokerMetrics::new(),
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedStateHandle = Arc<SharedState>;
