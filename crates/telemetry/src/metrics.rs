//! Internal metrics collection.
//!
//! Counters and gauges are collected in-memory and exposed through the
//! `/stats` and `/health` endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &bound) in Self::BUCKET_BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Value exceeds all buckets, add to last
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }
}

/// Collected metrics for the relay.
#[derive(Debug, Default)]
pub struct Metrics {
    // Ingestion metrics
    pub events_received: Counter,
    pub events_broadcast: Counter,
    pub messages_received: Counter,
    pub errors_recorded: Counter,
    pub sessions_started: Counter,
    pub sessions_ended: Counter,
    pub sessions_reassigned: Counter,

    // Batcher metrics
    pub batches_enqueued: Counter,
    pub batches_flushed: Counter,
    pub flush_errors: Counter,
    pub flush_latency_ms: Histogram,

    // Gauges
    pub connected_trackers: Gauge,
    pub connected_viewers: Gauge,
    pub active_sessions: Gauge,
    pub queue_depth: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            events_received: self.events_received.get(),
            events_broadcast: self.events_broadcast.get(),
            messages_received: self.messages_received.get(),
            sessions_started: self.sessions_started.get(),
            sessions_ended: self.sessions_ended.get(),
            batches_flushed: self.batches_flushed.get(),
            flush_errors: self.flush_errors.get(),
            flush_latency_mean_ms: self.flush_latency_ms.mean(),
            connected_trackers: self.connected_trackers.get(),
            connected_viewers: self.connected_viewers.get(),
            active_sessions: self.active_sessions.get(),
            queue_depth: self.queue_depth.get(),
        }
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub events_received: u64,
    pub events_broadcast: u64,
    pub messages_received: u64,
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub batches_flushed: u64,
    pub flush_errors: u64,
    pub flush_latency_mean_ms: f64,
    pub connected_trackers: u64,
    pub connected_viewers: u64,
    pub active_sessions: u64,
    pub queue_depth: u64,
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_mean() {
        let h = Histogram::new();
        assert_eq!(h.mean(), 0.0);

        h.observe(10);
        h.observe(30);
        assert_eq!(h.count(), 2);
        assert_eq!(h.sum(), 40);
        assert_eq!(h.mean(), 20.0);
    }

    #[test]
    fn test_gauge_inc_dec() {
        let g = Gauge::new();
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
    }
}
