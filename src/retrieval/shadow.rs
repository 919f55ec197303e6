//! # Shadow-Read Comparator
//!
//! Issues parallel, time-boxed reads against the migration target for a
//! sampled fraction of primary read requests, and records agreement and
//! ranking-quality distributions. The comparison never blocks the caller and
//! never surfaces an error into the primary read path: a sample that cannot
//! be taken is dropped and counted.
//!
//! Samples flow through a bounded channel into a fixed worker pool, so a slow
//! target backs up into dropped samples instead of unbounded memory growth.
//! Workers are detached from the caller's execution context; the shadow
//! query's own timeout is the only cancellation trigger.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::metrics::{MigrationMetrics, ShadowDropReason};
use crate::retrieval::backend::{SearchBackend, SearchQuery};
use crate::retrieval::ranking::{agreement_at_k, ndcg_at_k};

/// One sampled comparison, produced and consumed entirely within the
/// metrics-emission path.
#[derive(Debug)]
struct ShadowTask {
    query: SearchQuery,
    primary_ids: Vec<String>,
}

/// Fire-and-forget comparison sampler over a bounded worker pool.
pub struct ShadowComparator {
    sender: mpsc::Sender<ShadowTask>,
    sample_rate: f64,
    tenant_allowlist: Vec<String>,
    metrics: Arc<MigrationMetrics>,
    workers: Vec<JoinHandle<()>>,
}

impl ShadowComparator {
    pub fn new(
        config: &RetrievalConfig,
        target: Arc<dyn SearchBackend>,
        metrics: Arc<MigrationMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.shadow_queue_depth);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let timeout = config.shadow_timeout();

        let workers = (0..config.shadow_workers)
            .map(|worker_index| {
                let receiver = Arc::clone(&receiver);
                let target = Arc::clone(&target);
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    loop {
                        let task = {
                            let mut guard = receiver.lock().await;
                            guard.recv().await
                        };
                        let Some(task) = task else { break };
                        run_sample(task, target.as_ref(), &metrics, timeout).await;
                    }
                    debug!(worker_index, "Shadow worker drained and exiting");
                })
            })
            .collect();

        Self {
            sender,
            sample_rate: config.shadow_sample_rate,
            tenant_allowlist: config.tenant_allowlist.clone(),
            metrics,
            workers,
        }
    }

    fn tenant_allowed(&self, tenant: &str) -> bool {
        self.tenant_allowlist.is_empty() || self.tenant_allowlist.iter().any(|t| t == tenant)
    }

    fn sampled(&self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < self.sample_rate
    }

    /// Maybe dispatch a shadow comparison for a primary read. Never blocks,
    /// never errors; a full queue drops the sample and counts it.
    pub fn maybe_sample(&self, query: &SearchQuery, primary_ids: Vec<String>) {
        if !self.tenant_allowed(&query.tenant) || !self.sampled() {
            return;
        }
        let task = ShadowTask {
            query: query.clone(),
            primary_ids,
        };
        if self.sender.try_send(task).is_err() {
            self.metrics.record_shadow_drop(ShadowDropReason::QueueFull);
            debug!(
                trace_id = %query.trace_id,
                reason = "queue_full",
                "Shadow sample dropped"
            );
        }
    }

    /// Close the intake and wait for in-flight samples to finish. Used by
    /// tests and graceful shutdown; dropping the comparator also stops the
    /// workers once the queue drains.
    pub async fn shutdown(mut self) {
        drop(self.sender);
        futures::future::join_all(self.workers.drain(..)).await;
    }
}

async fn run_sample(
    task: ShadowTask,
    target: &dyn SearchBackend,
    metrics: &MigrationMetrics,
    timeout: Duration,
) {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, target.search(&task.query)).await;
    let latency = started.elapsed();

    match outcome {
        Ok(Ok(results)) => {
            let target_ids: Vec<String> =
                results.into_iter().map(|r| r.document_id).collect();
            let agreement = agreement_at_k(&task.primary_ids, &target_ids, 5);
            let ndcg = ndcg_at_k(&task.primary_ids, &target_ids, 10);

            metrics.shadow_latency_seconds.observe(latency.as_secs_f64());
            metrics.shadow_agreement_at_5.observe(agreement);
            metrics.shadow_ndcg_at_10.observe(ndcg);

            info!(
                trace_id = %task.query.trace_id,
                tenant = %task.query.tenant,
                target_name = target.name(),
                agreement_at_5 = agreement,
                ndcg_at_10 = ndcg,
                latency_ms = latency.as_millis() as u64,
                result = "sampled",
                "Shadow sample compared"
            );
        }
        Ok(Err(error)) => {
            metrics.record_shadow_drop(ShadowDropReason::Error);
            warn!(
                trace_id = %task.query.trace_id,
                tenant = %task.query.tenant,
                target_name = target.name(),
                error = %error,
                result = "dropped",
                "Shadow sample failed against target"
            );
        }
        Err(_) => {
            metrics.record_shadow_drop(ShadowDropReason::Timeout);
            warn!(
                trace_id = %task.query.trace_id,
                tenant = %task.query.tenant,
                target_name = target.name(),
                timeout_ms = timeout.as_millis() as u64,
                result = "dropped",
                "Shadow sample timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetrievalError;
    use crate::retrieval::backend::{MemoryBackend, SearchResult, WriteRequest};
    use async_trait::async_trait;

    fn config(sample_rate: f64) -> RetrievalConfig {
        RetrievalConfig {
            shadow_read_enabled: true,
            shadow_sample_rate: sample_rate,
            shadow_timeout_ms: 200,
            shadow_queue_depth: 8,
            shadow_workers: 1,
            ..RetrievalConfig::default()
        }
    }

    /// Target returning a fixed id list.
    struct FixedBackend {
        ids: Vec<&'static str>,
    }

    #[async_trait]
    impl SearchBackend for FixedBackend {
        fn name(&self) -> &str {
            "weaviate"
        }

        async fn write(&self, _request: &WriteRequest) -> Result<(), RetrievalError> {
            Ok(())
        }

        async fn search(&self, _query: &SearchQuery) -> Result<Vec<SearchResult>, RetrievalError> {
            Ok(self
                .ids
                .iter()
                .enumerate()
                .map(|(rank, id)| SearchResult {
                    document_id: (*id).to_string(),
                    score: 1.0 - rank as f64 * 0.1,
                    metadata: serde_json::Value::Null,
                })
                .collect())
        }
    }

    /// Target that never answers within any reasonable timeout.
    struct StuckBackend;

    #[async_trait]
    impl SearchBackend for StuckBackend {
        fn name(&self) -> &str {
            "weaviate"
        }

        async fn write(&self, _request: &WriteRequest) -> Result<(), RetrievalError> {
            Ok(())
        }

        async fn search(&self, _query: &SearchQuery) -> Result<Vec<SearchResult>, RetrievalError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn primary_ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn sampled_comparison_records_agreement_distribution() {
        let metrics = MigrationMetrics::new();
        let target = Arc::new(FixedBackend {
            ids: vec!["a", "c", "b", "f", "g"],
        });
        let comparator = ShadowComparator::new(&config(1.0), target, metrics.clone());

        let query = SearchQuery::new("t1", "anything", 5);
        comparator.maybe_sample(&query, primary_ids(&["a", "b", "c", "d", "e"]));
        comparator.shutdown().await;

        assert_eq!(metrics.shadow_agreement_at_5.count(), 1);
        // Agreement 3/5 = 0.6 for this fixture.
        assert!((metrics.shadow_agreement_at_5.mean() - 0.6).abs() < 1e-9);
        assert_eq!(metrics.shadow_ndcg_at_10.count(), 1);
        assert_eq!(metrics.shadow_latency_seconds.count(), 1);
    }

    #[tokio::test]
    async fn zero_sample_rate_never_samples() {
        let metrics = MigrationMetrics::new();
        let target = Arc::new(FixedBackend { ids: vec!["a"] });
        let comparator = ShadowComparator::new(&config(0.0), target, metrics.clone());

        let query = SearchQuery::new("t1", "anything", 5);
        comparator.maybe_sample(&query, primary_ids(&["a"]));
        comparator.shutdown().await;

        assert_eq!(metrics.shadow_agreement_at_5.count(), 0);
    }

    #[tokio::test]
    async fn allowlist_gates_sampling() {
        let metrics = MigrationMetrics::new();
        let target = Arc::new(FixedBackend { ids: vec!["a"] });
        let mut cfg = config(1.0);
        cfg.tenant_allowlist = vec!["tenant-a".to_string()];
        let comparator = ShadowComparator::new(&cfg, target, metrics.clone());

        comparator.maybe_sample(
            &SearchQuery::new("tenant-b", "q", 5),
            primary_ids(&["a"]),
        );
        comparator.maybe_sample(
            &SearchQuery::new("tenant-a", "q", 5),
            primary_ids(&["a"]),
        );
        comparator.shutdown().await;

        assert_eq!(metrics.shadow_agreement_at_5.count(), 1);
    }

    #[tokio::test]
    async fn timeout_drops_sample_and_counts_reason() {
        let metrics = MigrationMetrics::new();
        let mut cfg = config(1.0);
        cfg.shadow_timeout_ms = 20;
        let comparator = ShadowComparator::new(&cfg, Arc::new(StuckBackend), metrics.clone());

        comparator.maybe_sample(&SearchQuery::new("t1", "q", 5), primary_ids(&["a"]));
        comparator.shutdown().await;

        assert_eq!(metrics.shadow_dropped_total.get("timeout"), 1);
        assert_eq!(metrics.shadow_agreement_at_5.count(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_sample_and_counts_reason() {
        let metrics = MigrationMetrics::new();
        let mut cfg = config(1.0);
        cfg.shadow_queue_depth = 1;
        cfg.shadow_timeout_ms = 500;
        let comparator = ShadowComparator::new(&cfg, Arc::new(StuckBackend), metrics.clone());

        // First fills the worker, second fills the queue, third drops.
        for _ in 0..3 {
            comparator.maybe_sample(&SearchQuery::new("t1", "q", 5), primary_ids(&["a"]));
        }
        assert!(metrics.shadow_dropped_total.get("queue_full") >= 1);
        // Don't wait for the stuck samples; dropping the comparator lets the
        // timeout reap them in the background.
    }
}
