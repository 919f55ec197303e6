#![allow(clippy::doc_markdown)] // Allow technical terms like nDCG, FAISS in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Cutover Core
//!
//! Core subsystems for migrating a live search/retrieval service from a
//! primary index backend to a replacement backend, and for dispatching
//! asynchronous tasks off database transactions without duplicate side
//! effects.
//!
//! ## Overview
//!
//! Two tightly coupled subsystems carry the engineering risk of the
//! migration, and both live here:
//!
//! - **Retrieval migration proxy** ([`retrieval`]): dual-writes behind a
//!   per-target circuit breaker with a bounded outbox for failed target
//!   writes, and sampled shadow reads that compare ranking quality without
//!   touching the caller's response.
//! - **Post-commit idempotent dispatch** ([`dispatch`]): enqueue intents
//!   that fire only on durable commit (savepoint-aware), paired with an
//!   idempotency guard that bounds execution to at most one concurrent
//!   owner per canonical invocation key.
//!
//! ## Consistency stance
//!
//! Exactly-once delivery is not claimed anywhere: the transport is
//! at-least-once and the receiver is made safe to repeat. Dual-write
//! divergence between primary and target is resolved by outbox replay keyed
//! on content hash, not by automatic conflict resolution. A retrieval read
//! never fails because of target or shadow problems; a retrieval write
//! never fails because of target problems.
//!
//! ## Module Organization
//!
//! - [`retrieval`] - Migration proxy, circuit breaker, outbox, shadow reads
//! - [`dispatch`] - Post-commit dispatch and idempotency guard
//! - [`store`] - Shared atomic key-value store interface
//! - [`config`] - Configuration with env overrides and validation
//! - [`metrics`] - Process-local counters, gauges, and histograms
//! - [`error`] - Structured error taxonomy
//! - [`logging`] - Structured tracing initialization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cutover_core::config::CutoverConfig;
//! use cutover_core::metrics::MigrationMetrics;
//! use cutover_core::retrieval::{MemoryBackend, RetrievalProxy, SearchQuery, WriteRequest};
//! use std::sync::Arc;
//!
//! # async fn example() -> cutover_core::Result<()> {
//! let config = CutoverConfig::from_env()?;
//! let metrics = MigrationMetrics::new();
//! let proxy = RetrievalProxy::new(
//!     &config.retrieval,
//!     Arc::new(MemoryBackend::new("faiss")),
//!     Arc::new(MemoryBackend::new("weaviate")),
//!     metrics,
//! );
//!
//! proxy
//!     .write(WriteRequest::upsert("tenant-a", "doc-1", serde_json::json!({"text": "hello"})))
//!     .await?;
//! let results = proxy.search(SearchQuery::new("tenant-a", "hello", 5)).await?;
//! # let _ = results;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod retrieval;
pub mod store;

pub use config::{CutoverConfig, IdempotencyConfig, RetrievalConfig};
pub use error::{CutoverError, DispatchError, Result, RetrievalError};
pub use metrics::{MetricsSnapshot, MigrationMetrics};
