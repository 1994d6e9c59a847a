//! Operational counters and per-packet-type latency aggregates.
//!
//! Counters are plain atomics updated on the hot path by workers. Latency
//! observations update count, sum, and running max together, so they go
//! through one mutex-protected table: each observation is a single
//! serialized unit no matter which worker reports it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Latency aggregate for one packet-type label.
#[derive(Debug, Clone, Copy, Default)]
struct PacketTiming {
    count: u64,
    sum_ms: f64,
    max_ms: f64,
}

/// Process-lifetime broker metrics. Constructed once at startup and shared
/// with every worker and the HTTP exporter.
pub struct BrokerMetrics {
    started_at: Instant,

    pub connects_total: AtomicU64,
    pub disconnects_total: AtomicU64,
    pub subscribes_total: AtomicU64,
    pub publishes_total: AtomicU64,
    pub bytes_in_total: AtomicU64,
    pub bytes_out_total: AtomicU64,

    timings: Mutex<AHashMap<String, PacketTiming>>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connects_total: AtomicU64::new(0),
            disconnects_total: AtomicU64::new(0),
            subscribes_total: AtomicU64::new(0),
            publishes_total: AtomicU64::new(0),
            bytes_in_total: AtomicU64::new(0),
            bytes_out_total: AtomicU64::new(0),
            timings: Mutex::new(AHashMap::new()),
        }
    }

    #[inline]
    pub fn incr_connects(&self) {
        self.connects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_disconnects(&self) {
        self.disconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_subscribes(&self) {
        self.subscribes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_publishes(&self) {
        self.publishes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in_total.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out_total.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one handled packet of type `label` taking `elapsed_ms`.
    pub fn observe(&self, label: &str, elapsed_ms: f64) {
        let mut timings = self.timings.lock();
        match timings.get_mut(label) {
            Some(t) => {
                t.count += 1;
                t.sum_ms += elapsed_ms;
                if elapsed_ms > t.max_ms {
                    t.max_ms = elapsed_ms;
                }
            }
            None => {
                timings.insert(
                    label.to_string(),
                    PacketTiming {
                        count: 1,
                        sum_ms: elapsed_ms,
                        max_ms: elapsed_ms,
                    },
                );
            }
        }
    }

    /// Read-only, non-blocking view of every counter and aggregate.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut packet_count = BTreeMap::new();
        let mut packet_avg_ms = BTreeMap::new();
        let mut packet_max_ms = BTreeMap::new();

        {
            let timings = self.timings.lock();
            for (label, t) in timings.iter() {
                let avg = if t.count > 0 {
                    t.sum_ms / t.count as f64
                } else {
                    0.0
                };
                packet_count.insert(label.clone(), t.count);
                packet_avg_ms.insert(label.clone(), round3(avg));
                packet_max_ms.insert(label.clone(), round3(t.max_ms));
            }
        }

        MetricsSnapshot {
            uptime_sec: round2(self.started_at.elapsed().as_secs_f64()),
            connects_total: self.connects_total.load(Ordering::Relaxed),
            disconnects_total: self.disconnects_total.load(Ordering::Relaxed),
            subscribes_total: self.subscribes_total.load(Ordering::Relaxed),
            publishes_total: self.publishes_total.load(Ordering::Relaxed),
            bytes_in_total: self.bytes_in_total.load(Ordering::Relaxed),
            bytes_out_total: self.bytes_out_total.load(Ordering::Relaxed),
            packet_count,
            packet_avg_ms,
            packet_max_ms,
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Serializable snapshot served by the HTTP exporter. BTreeMaps keep the
/// label ordering stable across requests.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_sec: f64,
    pub connects_total: u64,
    pub disconnects_total: u64,
    pub subscribes_total: u64,
    pub publishes_total: u64,
    pub bytes_in_total: u64,
    pub bytes_out_total: u64,
    pub packet_count: BTreeMap<String, u64>,
    pub packet_avg_ms: BTreeMap<String, f64>,
    pub packet_max_ms: BTreeMap<String, f64>,
}
