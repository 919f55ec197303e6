//! # Retrieval Backend Migration
//!
//! Everything needed to move live search traffic from a primary index
//! backend to a replacement backend without downtime or read-path
//! regression:
//!
//! - **Dual-write** with a per-target circuit breaker and a bounded,
//!   TTL-limited outbox for failed target writes
//! - **Shadow-read** comparison sampling with agreement@5 / nDCG@10
//!   distributions
//! - A **proxy façade** composing both under runtime feature flags
//!
//! Target failures are never visible to callers; the write path's contract is
//! the primary backend's outcome alone.

pub mod backend;
pub mod circuit_breaker;
pub mod outbox;
pub mod proxy;
pub mod ranking;
pub mod shadow;

pub use backend::{
    MemoryBackend, SearchBackend, SearchQuery, SearchResult, WriteOperation, WriteRequest,
};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use outbox::{Outbox, OutboxItem, ReplayReport};
pub use proxy::{RetrievalProxy, TargetDisposition, WriteReceipt};
pub use ranking::{agreement_at_k, evaluate_truth_set, ndcg_at_k, CutoverScores, TruthEntry};
pub use shadow::ShadowComparator;
