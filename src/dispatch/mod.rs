//! # Post-Commit Idempotent Dispatch
//!
//! At-most-one side-effecting execution of asynchronous tasks triggered by
//! database transactions, under crashes, retries, and at-least-once
//! delivery:
//!
//! - **Post-commit dispatch**: enqueue intents fire only when the enclosing
//!   transaction durably commits, with savepoint-aware purging
//! - **Idempotency guard**: canonical, order-invariant deduplication keys and
//!   a time-boxed distributed lock over the shared atomic store
//!
//! Exactly-once is explicitly not claimed: the transport is at-least-once
//! and the guard makes redelivery safe.

pub mod canonical;
pub mod idempotency;
pub mod post_commit;

pub use canonical::{canonical_key, canonical_key_json, CanonicalValue};
pub use idempotency::{AcquireOutcome, IdempotencyGuard, IdempotencyRecord, TaskState};
pub use post_commit::{
    ChannelTaskSink, CommitReport, EnqueueIntent, SavepointId, TaskMessage, TaskSink,
    TransactionContext,
};
