//! # Post-Commit Dispatch
//!
//! Commit-gated task enqueueing. Application code registers enqueue intents
//! against a transaction-scoped context; intents become dispatched messages
//! only when the owning transaction durably commits, and are purged on
//! rollback at any nesting level. A savepoint rollback purges only intents
//! registered after that savepoint.
//!
//! This is the at-least-once half of the dispatch contract: the transport may
//! redeliver after a crash between commit and physical publish, and the
//! receiver absorbs duplicates through the idempotency guard. The context is
//! deliberately decoupled from any specific transaction API; whatever owns
//! the commit/rollback boundary calls the finalizers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::metrics::{EnqueueResult, MigrationMetrics};

/// A task enqueue registered inside a transaction, owned exclusively by the
/// enclosing transaction context until commit or rollback resolves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueIntent {
    pub task_name: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub registered_at: DateTime<Utc>,
}

/// Message handed to the task transport after a successful commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_name: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    /// Correlation id threaded through logs for this dispatch.
    pub trace_id: String,
    pub registered_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    fn from_intent(intent: EnqueueIntent) -> Self {
        Self {
            task_name: intent.task_name,
            args: intent.args,
            kwargs: intent.kwargs,
            trace_id: Uuid::new_v4().to_string(),
            registered_at: intent.registered_at,
            enqueued_at: Utc::now(),
        }
    }
}

/// Transport boundary for committed intents. The default implementation is a
/// bounded in-process channel; production deployments put a durable queue
/// behind this trait.
pub trait TaskSink: Send + Sync {
    fn dispatch(&self, message: TaskMessage) -> Result<(), DispatchError>;
}

/// Bounded channel-backed sink.
pub struct ChannelTaskSink {
    sender: mpsc::Sender<TaskMessage>,
}

impl ChannelTaskSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TaskMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl TaskSink for ChannelTaskSink {
    fn dispatch(&self, message: TaskMessage) -> Result<(), DispatchError> {
        let task_name = message.task_name.clone();
        self.sender
            .try_send(message)
            .map_err(|_| DispatchError::SinkRejected { task_name })
    }
}

/// Marker for a savepoint inside a transaction context. Valid until the
/// context resolves or an earlier savepoint is rolled back past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavepointId(usize);

/// Outcome of flushing a committed transaction's intents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub enqueued: usize,
    pub skipped: usize,
}

/// Transaction-scoped list of pending intents with savepoint support.
///
/// The owner of the real transaction calls [`commit`](Self::commit) after the
/// outermost commit succeeds, or [`rollback`](Self::rollback) when it aborts.
/// Dropping an unresolved context counts its intents as rolled back.
pub struct TransactionContext {
    intents: Vec<EnqueueIntent>,
    sink: Arc<dyn TaskSink>,
    metrics: Arc<MigrationMetrics>,
}

impl TransactionContext {
    pub fn new(sink: Arc<dyn TaskSink>, metrics: Arc<MigrationMetrics>) -> Self {
        Self {
            intents: Vec::new(),
            sink,
            metrics,
        }
    }

    /// Register an enqueue intent. Nothing is dispatched until commit.
    pub fn register(
        &mut self,
        task_name: impl Into<String>,
        args: serde_json::Value,
        kwargs: serde_json::Value,
    ) {
        let intent = EnqueueIntent {
            task_name: task_name.into(),
            args,
            kwargs,
            registered_at: Utc::now(),
        };
        debug!(task_name = %intent.task_name, "Enqueue intent registered");
        self.intents.push(intent);
    }

    /// Mark the current registration point as a savepoint.
    pub fn savepoint(&self) -> SavepointId {
        SavepointId(self.intents.len())
    }

    /// Purge intents registered after `savepoint`, mirroring a partial
    /// rollback of the underlying transaction. Intents registered before the
    /// savepoint are untouched.
    pub fn rollback_to(&mut self, savepoint: SavepointId) {
        let keep = savepoint.0.min(self.intents.len());
        let purged = self.intents.split_off(keep);
        for intent in &purged {
            self.metrics.record_enqueue_result(EnqueueResult::RolledBack);
            info!(
                task_name = %intent.task_name,
                result = "rolled_back",
                "Enqueue intent purged by savepoint rollback"
            );
        }
    }

    /// Number of intents currently pending.
    pub fn pending(&self) -> usize {
        self.intents.len()
    }

    /// The outermost transaction committed: hand every surviving intent to
    /// the task transport. A rejected dispatch is counted as skipped and
    /// logged; it never panics or unwinds into the caller's commit path.
    pub fn commit(mut self) -> CommitReport {
        let mut report = CommitReport::default();
        for intent in self.intents.drain(..) {
            let task_name = intent.task_name.clone();
            let message = TaskMessage::from_intent(intent);
            let trace_id = message.trace_id.clone();
            match self.sink.dispatch(message) {
                Ok(()) => {
                    report.enqueued += 1;
                    self.metrics.record_enqueue_result(EnqueueResult::Enqueued);
                    info!(
                        trace_id = %trace_id,
                        task_name = %task_name,
                        result = "enqueued",
                        "Intent dispatched after commit"
                    );
                }
                Err(error) => {
                    report.skipped += 1;
                    self.metrics.record_enqueue_result(EnqueueResult::Skipped);
                    warn!(
                        trace_id = %trace_id,
                        task_name = %task_name,
                        error = %error,
                        result = "skipped",
                        "Intent dropped at dispatch"
                    );
                }
            }
        }
        report
    }

    /// The transaction rolled back: purge every intent, dispatching none.
    pub fn rollback(mut self) {
        self.purge_all();
    }

    fn purge_all(&mut self) {
        for intent in self.intents.drain(..) {
            self.metrics.record_enqueue_result(EnqueueResult::RolledBack);
            info!(
                task_name = %intent.task_name,
                result = "rolled_back",
                "Enqueue intent purged by rollback"
            );
        }
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        // An unresolved context (e.g. the owning scope unwound) behaves like
        // a rollback: intents must never be dispatched without a commit.
        if !self.intents.is_empty() {
            self.purge_all();
        }
    }
}
