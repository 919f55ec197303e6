//! # Structured Error Types
//!
//! Error taxonomy for the migration proxy and dispatch pipeline using
//! thiserror for structured error types instead of `Box<dyn Error>` patterns.
//!
//! The taxonomy follows the operational split of the system: target-bound
//! transport problems are recoverable and never surface to callers, while
//! configuration and store problems follow explicit, configured policies.

use thiserror::Error;

/// Errors raised by the retrieval proxy and its collaborators.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// The primary backend rejected or failed a write/read. These are the only
    /// errors that propagate to the caller of the proxy.
    #[error("Primary backend error: {operation}: {message}")]
    Primary { operation: String, message: String },

    /// Transient failure talking to the migration target (network, timeout,
    /// 5xx). Recorded on the circuit breaker and routed to the outbox, never
    /// surfaced to the write caller.
    #[error("Target backend error: {target}: {message}")]
    Target { target: String, message: String },

    /// A target-bound operation exceeded its hard timeout. Treated identically
    /// to a transport error for breaker and drop accounting.
    #[error("Target operation timed out after {timeout_ms}ms: {target}")]
    TargetTimeout { target: String, timeout_ms: u64 },

    /// The circuit breaker is open for the named target.
    #[error("Circuit breaker is open for target: {target}")]
    CircuitOpen { target: String },

    /// Invalid or unresolvable backend name in configuration.
    #[error("Unknown retrieval backend: {name}")]
    UnknownBackend { name: String },
}

impl RetrievalError {
    pub fn primary(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Primary {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn target(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Target {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by the post-commit dispatcher and idempotency guard.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Another execution currently owns the idempotency key.
    #[error("Idempotency key busy: {key}")]
    KeyBusy { key: String },

    /// The shared atomic store backing the idempotency guard is unreachable.
    /// Handling follows the configured fail-open/fail-closed policy.
    #[error("Idempotency store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// The task channel was closed or full when a committed intent was
    /// flushed. The intent is counted as skipped, not lost silently.
    #[error("Task sink rejected intent for task: {task_name}")]
    SinkRejected { task_name: String },

    /// A value could not be normalized into a canonical key component.
    #[error("Canonicalization error: {message}")]
    Canonicalization { message: String },
}

impl DispatchError {
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }
}

/// Crate-level error wrapper for callers that compose both subsystems.
#[derive(Error, Debug)]
pub enum CutoverError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CutoverError>;
