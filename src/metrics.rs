//! # Migration Metrics
//!
//! Process-local metrics registry for the migration proxy and dispatch
//! pipeline: atomic counters, gauges, and fixed-bucket histograms with
//! serde-able snapshots for scraping or logging.
//!
//! Label cardinality is deliberately low: reasons, results, states, task and
//! target names. Tenant and document identifiers never appear in labels.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Reasons a shadow sample can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowDropReason {
    Timeout,
    QueueFull,
    Error,
}

impl ShadowDropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::QueueFull => "queue_full",
            Self::Error => "error",
        }
    }
}

/// Outcomes of a post-commit intent resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued,
    RolledBack,
    Skipped,
}

impl EnqueueResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::RolledBack => "rolled_back",
            Self::Skipped => "skipped",
        }
    }
}

/// Counter with a single string label, backed by a concurrent map.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    values: DashMap<String, AtomicU64>,
}

impl LabeledCounter {
    pub fn increment(&self, label: &str) {
        self.values
            .entry(label.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.values
            .get(label)
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    fn snapshot(&self) -> std::collections::BTreeMap<String, u64> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

/// Counter with two string labels joined as `first/second`.
#[derive(Debug, Default)]
pub struct LabeledCounter2 {
    inner: LabeledCounter,
}

impl LabeledCounter2 {
    pub fn increment(&self, first: &str, second: &str) {
        self.inner.increment(&format!("{first}/{second}"));
    }

    pub fn get(&self, first: &str, second: &str) -> u64 {
        self.inner.get(&format!("{first}/{second}"))
    }

    fn snapshot(&self) -> std::collections::BTreeMap<String, u64> {
        self.inner.snapshot()
    }
}

/// Fixed-bucket histogram with atomic bucket counters.
///
/// Buckets are cumulative-upper-bound style; observations above the last
/// bound land in the overflow bucket. Sum is tracked in micro-units to stay
/// atomic without a mutex.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    overflow: AtomicU64,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            overflow: AtomicU64::new(0),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    /// Evenly spaced bounds over [0, 1] for ratio-valued observations.
    pub fn ratio() -> Self {
        Self::new(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0])
    }

    /// Latency bounds in seconds, sub-millisecond through multi-second.
    pub fn latency_seconds() -> Self {
        Self::new(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 0.8, 1.0, 2.5, 5.0])
    }

    pub fn observe(&self, value: f64) {
        let clamped = value.max(0.0);
        match self.bounds.iter().position(|&bound| clamped <= bound) {
            Some(index) => self.buckets[index].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((clamped * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum() / count as f64
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.clone(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count: self.count(),
            sum: self.sum(),
        }
    }
}

/// Serde-able view of a histogram at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub bounds: Vec<f64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub sum: f64,
}

/// Full metrics surface of the crate. Shared via `Arc` between the proxy,
/// the dispatch pipeline, and the operational tools.
#[derive(Debug)]
pub struct MigrationMetrics {
    /// Target write failures during dual-write, labeled by target name.
    pub dual_write_errors_total: LabeledCounter,
    /// Target writes skipped because the circuit was open, labeled by reason.
    pub dual_write_skipped_total: LabeledCounter,
    /// Current number of pending outbox items.
    pub outbox_size: AtomicI64,
    /// Outbox items dropped by overflow or TTL expiry.
    pub outbox_dropped_total: AtomicU64,
    /// Items successfully replayed from the outbox.
    pub outbox_replayed_total: AtomicU64,
    /// Shadow read latency against the target, seconds.
    pub shadow_latency_seconds: Histogram,
    /// Agreement@5 between primary and target top results.
    pub shadow_agreement_at_5: Histogram,
    /// nDCG@10 of the target ranking against the primary ranking.
    pub shadow_ndcg_at_10: Histogram,
    /// Shadow samples dropped, labeled by reason.
    pub shadow_dropped_total: LabeledCounter,
    /// Post-commit intent resolutions, labeled by result.
    pub postcommit_enqueue_total: LabeledCounter,
    /// Idempotency acquisition attempts, labeled by task and result.
    pub idempotency_attempts_total: LabeledCounter2,
    /// Idempotency state transitions, labeled by task and state.
    pub idempotency_state_total: LabeledCounter2,
    /// Failures reaching the shared idempotency store.
    pub idempotency_store_errors_total: AtomicU64,
}

impl Default for MigrationMetrics {
    fn default() -> Self {
        Self {
            dual_write_errors_total: LabeledCounter::default(),
            dual_write_skipped_total: LabeledCounter::default(),
            outbox_size: AtomicI64::new(0),
            outbox_dropped_total: AtomicU64::new(0),
            outbox_replayed_total: AtomicU64::new(0),
            shadow_latency_seconds: Histogram::latency_seconds(),
            shadow_agreement_at_5: Histogram::ratio(),
            shadow_ndcg_at_10: Histogram::ratio(),
            shadow_dropped_total: LabeledCounter::default(),
            postcommit_enqueue_total: LabeledCounter::default(),
            idempotency_attempts_total: LabeledCounter2::default(),
            idempotency_state_total: LabeledCounter2::default(),
            idempotency_store_errors_total: AtomicU64::new(0),
        }
    }
}

impl MigrationMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_shadow_drop(&self, reason: ShadowDropReason) {
        self.shadow_dropped_total.increment(reason.as_str());
    }

    pub fn record_enqueue_result(&self, result: EnqueueResult) {
        self.postcommit_enqueue_total.increment(result.as_str());
    }

    pub fn set_outbox_size(&self, size: usize) {
        self.outbox_size.store(size as i64, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of every series, suitable for JSON export.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            collected_at: chrono::Utc::now(),
            dual_write_errors_total: self.dual_write_errors_total.snapshot(),
            dual_write_skipped_total: self.dual_write_skipped_total.snapshot(),
            outbox_size: self.outbox_size.load(Ordering::Relaxed),
            outbox_dropped_total: self.outbox_dropped_total.load(Ordering::Relaxed),
            outbox_replayed_total: self.outbox_replayed_total.load(Ordering::Relaxed),
            shadow_latency_seconds: self.shadow_latency_seconds.snapshot(),
            shadow_agreement_at_5: self.shadow_agreement_at_5.snapshot(),
            shadow_ndcg_at_10: self.shadow_ndcg_at_10.snapshot(),
            shadow_dropped_total: self.shadow_dropped_total.snapshot(),
            postcommit_enqueue_total: self.postcommit_enqueue_total.snapshot(),
            idempotency_attempts_total: self.idempotency_attempts_total.snapshot(),
            idempotency_state_total: self.idempotency_state_total.snapshot(),
            idempotency_store_errors_total: self
                .idempotency_store_errors_total
                .load(Ordering::Relaxed),
        }
    }
}

/// Serde-able snapshot of the whole metrics surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub collected_at: chrono::DateTime<chrono::Utc>,
    pub dual_write_errors_total: std::collections::BTreeMap<String, u64>,
    pub dual_write_skipped_total: std::collections::BTreeMap<String, u64>,
    pub outbox_size: i64,
    pub outbox_dropped_total: u64,
    pub outbox_replayed_total: u64,
    pub shadow_latency_seconds: HistogramSnapshot,
    pub shadow_agreement_at_5: HistogramSnapshot,
    pub shadow_ndcg_at_10: HistogramSnapshot,
    pub shadow_dropped_total: std::collections::BTreeMap<String, u64>,
    pub postcommit_enqueue_total: std::collections::BTreeMap<String, u64>,
    pub idempotency_attempts_total: std::collections::BTreeMap<String, u64>,
    pub idempotency_state_total: std::collections::BTreeMap<String, u64>,
    pub idempotency_store_errors_total: u64,
}
