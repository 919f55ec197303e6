//! # Retrieval Migration Proxy
//!
//! Façade over the primary and migration-target backends. Routes writes
//! (single-backend or dual-write) and reads (primary-only or
//! primary-plus-shadow), composing the circuit breaker, outbox, and shadow
//! comparator under runtime feature flags.
//!
//! The caller-visible outcome of every operation depends solely on the
//! primary backend: target failures are absorbed into the breaker and outbox,
//! shadow failures into drop counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RetrievalConfig;
use crate::error::RetrievalError;
use crate::metrics::MigrationMetrics;
use crate::retrieval::backend::{SearchBackend, SearchQuery, SearchResult, WriteRequest};
use crate::retrieval::circuit_breaker::CircuitBreaker;
use crate::retrieval::outbox::{Outbox, OutboxItem, ReplayReport};
use crate::retrieval::shadow::ShadowComparator;

/// What happened to the target half of a dual write. Informational only; the
/// caller's result is the primary outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetDisposition {
    /// Dual-write disabled; no target write attempted.
    Disabled,
    /// Target write succeeded.
    Written,
    /// Target write failed; the request went to the outbox.
    Outboxed,
    /// Circuit open; the request went to the outbox without an attempt.
    SkippedCircuitOpen,
}

/// Receipt for a proxied write. Present only when the primary succeeded.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub target: TargetDisposition,
    pub trace_id: String,
}

/// Migration proxy over a primary and a target backend.
pub struct RetrievalProxy {
    primary: Arc<dyn SearchBackend>,
    target: Arc<dyn SearchBackend>,
    dual_write_enabled: AtomicBool,
    shadow_read_enabled: AtomicBool,
    breaker: CircuitBreaker,
    outbox: Arc<Outbox>,
    shadow: ShadowComparator,
    metrics: Arc<MigrationMetrics>,
}

impl RetrievalProxy {
    pub fn new(
        config: &RetrievalConfig,
        primary: Arc<dyn SearchBackend>,
        target: Arc<dyn SearchBackend>,
        metrics: Arc<MigrationMetrics>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            config.circuit_failure_threshold,
            config.circuit_cooldown(),
            Arc::clone(&metrics),
        );
        let outbox = Arc::new(Outbox::new(
            config.outbox_max_items,
            config.outbox_ttl(),
            Arc::clone(&metrics),
        ));
        let shadow = ShadowComparator::new(config, Arc::clone(&target), Arc::clone(&metrics));
        Self {
            primary,
            target,
            dual_write_enabled: AtomicBool::new(config.dual_write_enabled),
            shadow_read_enabled: AtomicBool::new(config.shadow_read_enabled),
            breaker,
            outbox,
            shadow,
            metrics,
        }
    }

    /// Write a document. The primary write is always performed and its
    /// outcome returned synchronously; with dual-write enabled the target
    /// write follows immediately after the primary commit point and can only
    /// influence the receipt, never the result.
    pub async fn write(&self, request: WriteRequest) -> Result<WriteReceipt, RetrievalError> {
        let trace_id = uuid::Uuid::new_v4().to_string();

        self.primary.write(&request).await?;

        if !self.dual_write_enabled.load(Ordering::Relaxed) {
            return Ok(WriteReceipt {
                target: TargetDisposition::Disabled,
                trace_id,
            });
        }

        let target_name = self.target.name().to_string();
        let disposition = if self.breaker.allow_write(&target_name) {
            match self.target.write(&request).await {
                Ok(()) => {
                    self.breaker.record_result(&target_name, true);
                    TargetDisposition::Written
                }
                Err(error) => {
                    self.breaker.record_result(&target_name, false);
                    self.metrics.dual_write_errors_total.increment(&target_name);
                    warn!(
                        trace_id = %trace_id,
                        tenant = %request.tenant,
                        target_name = %target_name,
                        error = %error,
                        result = "outboxed",
                        "Dual-write to target failed"
                    );
                    self.outbox
                        .enqueue(OutboxItem::new(request, target_name.clone()));
                    TargetDisposition::Outboxed
                }
            }
        } else {
            // Failing fast still preserves the write for replay.
            self.outbox
                .enqueue(OutboxItem::new(request, target_name.clone()));
            TargetDisposition::SkippedCircuitOpen
        };

        Ok(WriteReceipt {
            target: disposition,
            trace_id,
        })
    }

    /// Read from the primary. With shadow-read enabled, a sampled copy of the
    /// request is dispatched to the comparator without awaiting it.
    pub async fn search(&self, query: SearchQuery) -> Result<Vec<SearchResult>, RetrievalError> {
        let results = self.primary.search(&query).await?;

        if self.shadow_read_enabled.load(Ordering::Relaxed) {
            let primary_ids: Vec<String> =
                results.iter().map(|r| r.document_id.clone()).collect();
            self.shadow.maybe_sample(&query, primary_ids);
        }

        Ok(results)
    }

    /// Replay pending outbox items against the target.
    pub async fn replay_outbox(&self, max_items: usize, sleep_between: Duration) -> ReplayReport {
        self.outbox
            .replay(self.target.as_ref(), max_items, sleep_between)
            .await
    }

    /// Count replayable items without writing (`--dry-run`).
    pub fn outbox_dry_run(&self) -> ReplayReport {
        self.outbox.dry_run()
    }

    /// Drop outbox items that exceeded the TTL.
    pub fn drop_expired_outbox(&self) -> usize {
        self.outbox.drop_expired()
    }

    /// Disable dual-write and shadow-read at runtime. This is the rollback
    /// tool's hook: primary-only service continues unchanged.
    pub fn disable_migration(&self) {
        let dual_before = self.dual_write_enabled.swap(false, Ordering::Relaxed);
        let shadow_before = self.shadow_read_enabled.swap(false, Ordering::Relaxed);
        info!(
            dual_write_before = dual_before,
            shadow_read_before = shadow_before,
            result = "disabled",
            "Migration flags disabled"
        );
    }

    pub fn dual_write_enabled(&self) -> bool {
        self.dual_write_enabled.load(Ordering::Relaxed)
    }

    pub fn shadow_read_enabled(&self) -> bool {
        self.shadow_read_enabled.load(Ordering::Relaxed)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.metrics
    }

    /// Close the shadow queue and wait for in-flight samples. For graceful
    /// shutdown and deterministic tests.
    pub async fn shutdown(self) {
        self.shadow.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::backend::MemoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    /// Target whose writes fail while `failing` is set.
    struct SwitchableBackend {
        failing: StdAtomicBool,
        inner: MemoryBackend,
    }

    impl SwitchableBackend {
        fn failing() -> Self {
            Self {
                failing: StdAtomicBool::new(true),
                inner: MemoryBackend::new("weaviate"),
            }
        }

        fn healthy() -> Self {
            Self {
                failing: StdAtomicBool::new(false),
                inner: MemoryBackend::new("weaviate"),
            }
        }
    }

    #[async_trait]
    impl SearchBackend for SwitchableBackend {
        fn name(&self) -> &str {
            "weaviate"
        }

        async fn write(&self, request: &WriteRequest) -> Result<(), RetrievalError> {
            if self.failing.load(Ordering::Relaxed) {
                return Err(RetrievalError::target("weaviate", "connection refused"));
            }
            self.inner.write(request).await
        }

        async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, RetrievalError> {
            self.inner.search(query).await
        }
    }

    fn dual_write_config() -> RetrievalConfig {
        RetrievalConfig {
            dual_write_enabled: true,
            ..RetrievalConfig::default()
        }
    }

    fn doc(id: &str) -> WriteRequest {
        WriteRequest::upsert("t1", id, serde_json::json!({"text": format!("doc {id}")}))
    }

    #[tokio::test]
    async fn target_failure_never_fails_the_caller() {
        let metrics = MigrationMetrics::new();
        let primary = Arc::new(MemoryBackend::new("faiss"));
        let target = Arc::new(SwitchableBackend::failing());
        let proxy = RetrievalProxy::new(&dual_write_config(), primary.clone(), target, metrics.clone());

        let receipt = proxy.write(doc("d1")).await.unwrap();
        assert_eq!(receipt.target, TargetDisposition::Outboxed);
        assert!(primary.contains("t1", "d1"));
        assert_eq!(proxy.outbox().len(), 1);
        assert_eq!(proxy.outbox().snapshot()[0].attempt_count, 0);
        assert_eq!(metrics.dual_write_errors_total.get("weaviate"), 1);
    }

    #[tokio::test]
    async fn primary_failure_propagates_to_caller() {
        struct BrokenPrimary;

        #[async_trait]
        impl SearchBackend for BrokenPrimary {
            fn name(&self) -> &str {
                "faiss"
            }

            async fn write(&self, _request: &WriteRequest) -> Result<(), RetrievalError> {
                Err(RetrievalError::primary("write", "index corrupt"))
            }

            async fn search(
                &self,
                _query: &SearchQuery,
            ) -> Result<Vec<SearchResult>, RetrievalError> {
                Err(RetrievalError::primary("search", "index corrupt"))
            }
        }

        let metrics = MigrationMetrics::new();
        let proxy = RetrievalProxy::new(
            &dual_write_config(),
            Arc::new(BrokenPrimary),
            Arc::new(SwitchableBackend::healthy()),
            metrics,
        );
        assert!(proxy.write(doc("d1")).await.is_err());
        // Primary never committed, so nothing belongs in the outbox.
        assert_eq!(proxy.outbox().len(), 0);
    }

    #[tokio::test]
    async fn breaker_trips_after_threshold_and_skips_attempts() {
        let metrics = MigrationMetrics::new();
        let proxy = RetrievalProxy::new(
            &dual_write_config(),
            Arc::new(MemoryBackend::new("faiss")),
            Arc::new(SwitchableBackend::failing()),
            metrics.clone(),
        );

        for i in 0..3 {
            let receipt = proxy.write(doc(&format!("d{i}"))).await.unwrap();
            assert_eq!(receipt.target, TargetDisposition::Outboxed);
        }
        // Breaker is open now; the next write is skipped, not attempted.
        let receipt = proxy.write(doc("d4")).await.unwrap();
        assert_eq!(receipt.target, TargetDisposition::SkippedCircuitOpen);
        assert_eq!(metrics.dual_write_errors_total.get("weaviate"), 3);
        assert_eq!(metrics.dual_write_skipped_total.get("circuit_open"), 1);
        assert_eq!(proxy.outbox().len(), 4);
    }

    #[tokio::test]
    async fn dual_write_disabled_touches_only_primary() {
        let metrics = MigrationMetrics::new();
        let target = Arc::new(SwitchableBackend::healthy());
        let proxy = RetrievalProxy::new(
            &RetrievalConfig::default(),
            Arc::new(MemoryBackend::new("faiss")),
            target.clone(),
            metrics,
        );
        let receipt = proxy.write(doc("d1")).await.unwrap();
        assert_eq!(receipt.target, TargetDisposition::Disabled);
        assert!(!target.inner.contains("t1", "d1"));
    }

    #[tokio::test]
    async fn dual_write_success_lands_in_both_backends() {
        let metrics = MigrationMetrics::new();
        let primary = Arc::new(MemoryBackend::new("faiss"));
        let target = Arc::new(SwitchableBackend::healthy());
        let proxy =
            RetrievalProxy::new(&dual_write_config(), primary.clone(), target.clone(), metrics);

        let receipt = proxy.write(doc("d1")).await.unwrap();
        assert_eq!(receipt.target, TargetDisposition::Written);
        assert!(primary.contains("t1", "d1"));
        assert!(target.inner.contains("t1", "d1"));
        assert_eq!(proxy.outbox().len(), 0);
    }

    #[tokio::test]
    async fn replay_drains_outbox_once_target_recovers() {
        let metrics = MigrationMetrics::new();
        let target = Arc::new(SwitchableBackend::failing());
        let proxy = RetrievalProxy::new(
            &dual_write_config(),
            Arc::new(MemoryBackend::new("faiss")),
            target.clone(),
            metrics,
        );

        proxy.write(doc("d1")).await.unwrap();
        assert_eq!(proxy.outbox().len(), 1);

        target.failing.store(false, Ordering::Relaxed);
        let report = proxy.replay_outbox(100, Duration::ZERO).await;
        assert_eq!(report.replayed, 1);
        assert!(report.is_clean());
        assert!(target.inner.contains("t1", "d1"));
    }

    #[tokio::test]
    async fn search_serves_primary_and_shadow_never_blocks() {
        let metrics = MigrationMetrics::new();
        let primary = Arc::new(MemoryBackend::new("faiss"));
        primary.write(&doc("d1")).await.unwrap();

        let config = RetrievalConfig {
            shadow_read_enabled: true,
            shadow_sample_rate: 1.0,
            ..RetrievalConfig::default()
        };
        let proxy = RetrievalProxy::new(
            &config,
            primary,
            Arc::new(SwitchableBackend::healthy()),
            metrics.clone(),
        );

        let results = proxy
            .search(SearchQuery::new("t1", "doc", 5))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        proxy.shutdown().await;
        assert_eq!(metrics.shadow_latency_seconds.count(), 1);
    }

    #[tokio::test]
    async fn disable_migration_flips_both_flags_off() {
        let config = RetrievalConfig {
            dual_write_enabled: true,
            shadow_read_enabled: true,
            ..RetrievalConfig::default()
        };
        let proxy = RetrievalProxy::new(
            &config,
            Arc::new(MemoryBackend::new("faiss")),
            Arc::new(SwitchableBackend::healthy()),
            MigrationMetrics::new(),
        );
        assert!(proxy.dual_write_enabled());
        proxy.disable_migration();
        assert!(!proxy.dual_write_enabled());
        assert!(!proxy.shadow_read_enabled());

        let receipt = proxy.write(doc("d1")).await.unwrap();
        assert_eq!(receipt.target, TargetDisposition::Disabled);
    }
}
