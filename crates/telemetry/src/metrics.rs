//! Internal metrics collection.
//!
//! Counters for the relay and collector paths, held in memory and exposed
//! through `GET /metrics`.

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
        self.sub(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrease without wrapping below zero.
    pub fn sub(&self, n: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
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

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the relay and the collector.
#[derive(Debug, Default)]
pub struct Metrics {
    // Relay ingestion
    pub packets_received: Counter,
    pub packets_malformed: Counter,
    pub attributes_enqueued: Counter,
    pub sessions_started: Counter,
    pub handshake_failures: Counter,
    pub handshake_retries: Counter,

    // Relay flushes
    pub flushes_by_count: Counter,
    pub flushes_by_timeout: Counter,
    pub flushes_on_shutdown: Counter,
    pub empty_flushes: Counter,

    // Uploads
    pub uploads_succeeded: Counter,
    pub uploads_upstream_unknown: Counter,
    pub uploads_failed: Counter,
    pub attributes_uploaded: Counter,
    pub attributes_lost: Counter,

    // Collector
    pub upload_requests: Counter,
    pub attributes_received: Counter,
    pub store_errors: Counter,

    // Fan-out
    pub attributes_published: Counter,
    pub watch_polls: Counter,
    pub watch_timeouts: Counter,
    pub watch_items_dropped: Counter,

    // Latency histograms
    pub upload_latency_ms: Histogram,
    pub store_latency_ms: Histogram,

    // Gauges
    pub active_watchers: Gauge,
    pub active_sessions: Gauge,
    pub pending_attributes: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub packets_received: u64,
    pub packets_malformed: u64,
    pub attributes_enqueued: u64,
    pub sessions_started: u64,
    pub handshake_failures: u64,
    pub handshake_retries: u64,
    pub flushes_by_count: u64,
    pub flushes_by_timeout: u64,
    pub uploads_succeeded: u64,
    pub uploads_upstream_unknown: u64,
    pub uploads_failed: u64,
    pub attributes_uploaded: u64,
    pub attributes_lost: u64,
    pub upload_requests: u64,
    pub attributes_received: u64,
    pub store_errors: u64,
    pub attributes_published: u64,
    pub watch_polls: u64,
    pub watch_timeouts: u64,
    pub watch_items_dropped: u64,
    pub upload_latency_mean_ms: f64,
    pub store_latency_mean_ms: f64,
    pub active_watchers: u64,
    pub active_sessions: u64,
    pub pending_attributes: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            packets_received: self.packets_received.get(),
            packets_malformed: self.packets_malformed.get(),
            attributes_enqueued: self.attributes_enqueued.get(),
            sessions_started: self.sessions_started.get(),
            handshake_failures: self.handshake_failures.get(),
            handshake_retries: self.handshake_retries.get(),
            flushes_by_count: self.flushes_by_count.get(),
            flushes_by_timeout: self.flushes_by_timeout.get(),
            uploads_succeeded: self.uploads_succeeded.get(),
            uploads_upstream_unknown: self.uploads_upstream_unknown.get(),
            uploads_failed: self.uploads_failed.get(),
            attributes_uploaded: self.attributes_uploaded.get(),
            attributes_lost: self.attributes_lost.get(),
            upload_requests: self.upload_requests.get(),
            attributes_received: self.attributes_received.get(),
            store_errors: self.store_errors.get(),
            attributes_published: self.attributes_published.get(),
            watch_polls: self.watch_polls.get(),
            watch_timeouts: self.watch_timeouts.get(),
            watch_items_dropped: self.watch_items_dropped.get(),
            upload_latency_mean_ms: self.upload_latency_ms.mean(),
            store_latency_mean_ms: self.store_latency_ms.mean(),
            active_watchers: self.active_watchers.get(),
            active_sessions: self.active_sessions.get(),
            pending_attributes: self.pending_attributes.get(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
