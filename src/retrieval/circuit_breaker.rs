//! # Dual-Write Circuit Breaker
//!
//! Fault isolation for target-bound writes during backend migration. Follows
//! the classic circuit breaker pattern with three states: Closed (normal
//! operation), Open (failing fast for a cooldown window), and HalfOpen
//! (exactly one probe write testing recovery).
//!
//! State is per-instance and per-target: the breaker protects the writing
//! process, and every instance observes the same target failures, so a shared
//! breaker would add a store dependency for little gain. The trade-off is up
//! to one probe write per instance per cooldown window.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::metrics::MigrationMetrics;

/// Circuit breaker states representing the current operational mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - target writes are attempted.
    Closed,
    /// Failure mode - target writes are skipped without being attempted.
    Open,
    /// Testing recovery - a single probe write is in flight.
    HalfOpen,
}

#[derive(Debug)]
struct TargetState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl TargetState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Per-target circuit breaker gating dual-write attempts.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    targets: DashMap<String, Arc<Mutex<TargetState>>>,
    metrics: Arc<MigrationMetrics>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration, metrics: Arc<MigrationMetrics>) -> Self {
        Self {
            failure_threshold,
            cooldown,
            targets: DashMap::new(),
            metrics,
        }
    }

    fn target_state(&self, target: &str) -> Arc<Mutex<TargetState>> {
        self.targets
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TargetState::new())))
            .clone()
    }

    /// Whether a write to `target` should be attempted right now.
    ///
    /// While open, returns `false` (fail fast) and counts the skip. Once the
    /// cooldown elapses, exactly one caller is let through as the half-open
    /// probe; concurrent callers keep failing fast until the probe resolves
    /// via [`record_result`](Self::record_result).
    pub fn allow_write(&self, target: &str) -> bool {
        let state = self.target_state(target);
        let mut guard = state.lock();
        let allowed = match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = guard.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    guard.state = CircuitState::HalfOpen;
                    info!(
                        target_name = target,
                        cooldown_s = self.cooldown.as_secs(),
                        "Circuit breaker half-open, allowing probe write"
                    );
                    true
                } else {
                    false
                }
            }
            // Probe already in flight; hold the line.
            CircuitState::HalfOpen => false,
        };
        if !allowed {
            self.metrics.dual_write_skipped_total.increment("circuit_open");
            debug!(target_name = target, "Target write skipped, circuit open");
        }
        allowed
    }

    /// Record the outcome of an attempted target write.
    pub fn record_result(&self, target: &str, success: bool) {
        let state = self.target_state(target);
        let mut guard = state.lock();
        if success {
            if guard.state != CircuitState::Closed {
                info!(target_name = target, "Circuit breaker closed (recovered)");
            }
            guard.state = CircuitState::Closed;
            guard.consecutive_failures = 0;
            guard.opened_at = None;
            return;
        }

        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                    warn!(
                        target_name = target,
                        consecutive_failures = guard.consecutive_failures,
                        failure_threshold = self.failure_threshold,
                        cooldown_s = self.cooldown.as_secs(),
                        "Circuit breaker opened (failing fast)"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed; re-open with a fresh window.
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
                warn!(
                    target_name = target,
                    "Probe write failed, circuit breaker re-opened"
                );
            }
            CircuitState::Open => {
                guard.consecutive_failures += 1;
            }
        }
    }

    /// Current state for `target`, for health reporting.
    pub fn state(&self, target: &str) -> CircuitState {
        self.target_state(target).lock().state
    }

    /// Force the circuit open for a target (emergency stop for dual-writes).
    pub fn force_open(&self, target: &str) {
        warn!(target_name = target, "Circuit breaker forced open");
        let state = self.target_state(target);
        let mut guard = state.lock();
        guard.state = CircuitState::Open;
        guard.opened_at = Some(Instant::now());
    }

    /// Force the circuit closed for a target (emergency recovery).
    pub fn force_closed(&self, target: &str) {
        warn!(target_name = target, "Circuit breaker forced closed");
        let state = self.target_state(target);
        let mut guard = state.lock();
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
        guard.opened_at = None;
    }
}
