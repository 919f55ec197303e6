//! # Dual-Write Outbox
//!
//! Bounded, age-limited buffer for writes that failed to reach the migration
//! target while the primary write succeeded. Items wait here for replay by
//! the periodic `outbox-replay` tool; the buffer drops the oldest item on
//! overflow and drops expired items on housekeeping passes, counting every
//! drop rather than discarding silently.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::metrics::MigrationMetrics;
use crate::retrieval::backend::{SearchBackend, WriteRequest};

/// A write awaiting replay against the target backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    pub request: WriteRequest,
    pub target_name: String,
    pub first_seen_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl OutboxItem {
    pub fn new(request: WriteRequest, target_name: impl Into<String>) -> Self {
        Self {
            request,
            target_name: target_name.into(),
            first_seen_at: Utc::now(),
            attempt_count: 0,
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.first_seen_at).to_std().unwrap_or_default()
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    /// Items successfully written to the target and removed.
    pub replayed: usize,
    /// Items that failed again and were re-queued with a bumped attempt count.
    pub failed: usize,
    /// Items dropped because they exceeded the TTL.
    pub dropped: usize,
    /// Items still pending after the pass.
    pub remaining: usize,
}

impl ReplayReport {
    /// A pass is clean when nothing replayable remains.
    pub fn is_clean(&self) -> bool {
        self.remaining == 0
    }
}

/// Bounded FIFO outbox with TTL-based expiry.
#[derive(Debug)]
pub struct Outbox {
    items: Mutex<VecDeque<OutboxItem>>,
    max_items: usize,
    ttl: Duration,
    metrics: Arc<MigrationMetrics>,
}

impl Outbox {
    pub fn new(max_items: usize, ttl: Duration, metrics: Arc<MigrationMetrics>) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(max_items.min(1024))),
            max_items,
            ttl,
            metrics,
        }
    }

    /// Queue a failed target write for later replay. When the buffer is at
    /// capacity the oldest pending item is dropped first.
    pub fn enqueue(&self, item: OutboxItem) {
        let size = {
            let mut items = self.items.lock();
            if items.len() >= self.max_items {
                if let Some(evicted) = items.pop_front() {
                    self.metrics.outbox_dropped_total.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target_name = %evicted.target_name,
                        tenant = %evicted.request.tenant,
                        age_s = evicted.age(Utc::now()).as_secs(),
                        "Outbox full, dropped oldest pending item"
                    );
                }
            }
            items.push_back(item);
            items.len()
        };
        self.metrics.set_outbox_size(size);
    }

    /// Drop every item older than the TTL. Returns the number dropped.
    pub fn drop_expired(&self) -> usize {
        let now = Utc::now();
        let (dropped, size) = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|item| item.age(now) <= self.ttl);
            (before - items.len(), items.len())
        };
        if dropped > 0 {
            self.metrics
                .outbox_dropped_total
                .fetch_add(dropped as u64, Ordering::Relaxed);
            info!(dropped, "Dropped expired outbox items");
        }
        self.metrics.set_outbox_size(size);
        dropped
    }

    /// Replay up to `max_items` against `target`, sleeping `sleep_between`
    /// between items to bound recovery blast radius on the target.
    ///
    /// Successful items are removed; failed items are re-queued with a bumped
    /// attempt count unless they expired mid-pass. The target write is keyed
    /// on content hash, so replaying an unchanged document is a no-op there.
    pub async fn replay(
        &self,
        target: &dyn SearchBackend,
        max_items: usize,
        sleep_between: Duration,
    ) -> ReplayReport {
        let mut report = ReplayReport::default();
        self.drop_expired();

        for index in 0..max_items {
            let item = {
                let mut items = self.items.lock();
                items.pop_front()
            };
            let Some(mut item) = item else { break };

            if index > 0 && !sleep_between.is_zero() {
                tokio::time::sleep(sleep_between).await;
            }

            match target.write(&item.request).await {
                Ok(()) => {
                    report.replayed += 1;
                    self.metrics.outbox_replayed_total.fetch_add(1, Ordering::Relaxed);
                    info!(
                        target_name = %item.target_name,
                        tenant = %item.request.tenant,
                        attempt_count = item.attempt_count,
                        result = "replayed",
                        "Outbox item replayed"
                    );
                }
                Err(error) => {
                    item.attempt_count += 1;
                    if item.age(Utc::now()) > self.ttl {
                        report.dropped += 1;
                        self.metrics.outbox_dropped_total.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target_name = %item.target_name,
                            tenant = %item.request.tenant,
                            error = %error,
                            result = "dropped",
                            "Outbox item expired during replay"
                        );
                    } else {
                        report.failed += 1;
                        warn!(
                            target_name = %item.target_name,
                            tenant = %item.request.tenant,
                            attempt_count = item.attempt_count,
                            error = %error,
                            result = "requeued",
                            "Outbox replay attempt failed"
                        );
                        self.items.lock().push_back(item);
                    }
                }
            }
        }

        let size = self.items.lock().len();
        self.metrics.set_outbox_size(size);
        report.remaining = size;
        report
    }

    /// Count items without issuing any target writes (`--dry-run`).
    pub fn dry_run(&self) -> ReplayReport {
        let now = Utc::now();
        let items = self.items.lock();
        let expired = items.iter().filter(|item| item.age(now) > self.ttl).count();
        ReplayReport {
            replayed: 0,
            failed: 0,
            dropped: expired,
            remaining: items.len() - expired,
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Clone of the pending items, oldest first.
    pub fn snapshot(&self) -> Vec<OutboxItem> {
        self.items.lock().iter().cloned().collect()
    }
}
