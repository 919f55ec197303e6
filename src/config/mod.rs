//! # Cutover Configuration System
//!
//! Configuration for the retrieval migration proxy and the post-commit
//! dispatch pipeline. Values come from explicit construction or from
//! `CUTOVER_*` environment variables, with documented defaults and explicit
//! validation. There are no silent fallbacks: an invalid numeric override is
//! a configuration error, not a default.
//!
//! Both migration flags default to **off**. Flipping them on is an operator
//! decision; flipping them off again is what the rollback tool does.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CutoverError;

/// Truthy values accepted for boolean environment overrides.
const TRUE_VALUES: [&str; 4] = ["1", "true", "yes", "on"];

/// Retrieval migration configuration (dual-write + shadow-read).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Write every mutation to the migration target as well as the primary.
    pub dual_write_enabled: bool,

    /// Issue sampled comparison reads against the migration target.
    pub shadow_read_enabled: bool,

    /// Name of the migration target backend (e.g. "weaviate").
    pub target_backend: String,

    /// Fraction of primary reads sampled for shadow comparison (0.0..=1.0).
    pub shadow_sample_rate: f64,

    /// Hard timeout for a shadow read against the target, in milliseconds.
    pub shadow_timeout_ms: u64,

    /// Bounded depth of the shadow sampling queue; overflow drops samples.
    pub shadow_queue_depth: usize,

    /// Number of background workers draining the shadow queue.
    pub shadow_workers: usize,

    /// Tenants eligible for shadow sampling. Empty means all tenants.
    pub tenant_allowlist: Vec<String>,

    /// Consecutive target-write failures before the circuit opens.
    pub circuit_failure_threshold: u32,

    /// Seconds the circuit stays open before a half-open probe is allowed.
    pub circuit_cooldown_s: u64,

    /// Maximum number of pending items in the outbox.
    pub outbox_max_items: usize,

    /// Seconds after which an unplayed outbox item is considered stale.
    pub outbox_ttl_s: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dual_write_enabled: false,
            shadow_read_enabled: false,
            target_backend: "weaviate".to_string(),
            shadow_sample_rate: 0.25,
            shadow_timeout_ms: 800,
            shadow_queue_depth: 256,
            shadow_workers: 2,
            tenant_allowlist: Vec::new(),
            circuit_failure_threshold: 3,
            circuit_cooldown_s: 30,
            outbox_max_items: 1000,
            outbox_ttl_s: 86400,
        }
    }
}

impl RetrievalConfig {
    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_s)
    }

    pub fn shadow_timeout(&self) -> Duration {
        Duration::from_millis(self.shadow_timeout_ms)
    }

    pub fn outbox_ttl(&self) -> Duration {
        Duration::from_secs(self.outbox_ttl_s)
    }

    /// Whether a tenant is eligible for shadow sampling.
    pub fn tenant_allowed(&self, tenant: &str) -> bool {
        self.tenant_allowlist.is_empty() || self.tenant_allowlist.iter().any(|t| t == tenant)
    }
}

/// Idempotency guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// TTL for idempotency records, bounding zombie locks after a crash.
    pub ttl_s: u64,

    /// Policy when the shared store is unreachable: `true` allows execution
    /// (at-least-once plus natural retries absorb duplicates), `false`
    /// rejects it. Never a silent skip either way.
    pub fail_open: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_s: 300,
            fail_open: true,
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_s)
    }
}

/// Root configuration for the crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CutoverConfig {
    pub retrieval: RetrievalConfig,
    pub idempotency: IdempotencyConfig,
}

impl CutoverConfig {
    /// Build a configuration from defaults overlaid with `CUTOVER_*`
    /// environment variables, then validate.
    pub fn from_env() -> Result<Self, CutoverError> {
        let mut config = Self::default();

        if let Some(v) = env_bool("CUTOVER_DUAL_WRITE") {
            config.retrieval.dual_write_enabled = v;
        }
        if let Some(v) = env_bool("CUTOVER_SHADOW_READ") {
            config.retrieval.shadow_read_enabled = v;
        }
        if let Ok(v) = std::env::var("CUTOVER_TARGET_BACKEND") {
            config.retrieval.target_backend = v.trim().to_lowercase();
        }
        if let Some(v) = env_parse::<f64>("CUTOVER_SHADOW_SAMPLE_RATE")? {
            config.retrieval.shadow_sample_rate = v;
        }
        if let Some(v) = env_parse::<u64>("CUTOVER_SHADOW_TIMEOUT_MS")? {
            config.retrieval.shadow_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u32>("CUTOVER_CIRCUIT_FAILURE_THRESHOLD")? {
            config.retrieval.circuit_failure_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("CUTOVER_CIRCUIT_COOLDOWN_S")? {
            config.retrieval.circuit_cooldown_s = v;
        }
        if let Some(v) = env_parse::<usize>("CUTOVER_OUTBOX_MAX_ITEMS")? {
            config.retrieval.outbox_max_items = v;
        }
        if let Some(v) = env_parse::<u64>("CUTOVER_OUTBOX_TTL_S")? {
            config.retrieval.outbox_ttl_s = v;
        }
        if let Ok(v) = std::env::var("CUTOVER_TENANT_ALLOWLIST") {
            config.retrieval.tenant_allowlist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = env_parse::<u64>("CUTOVER_IDEMPOTENCY_TTL_S")? {
            config.idempotency.ttl_s = v;
        }
        if let Some(v) = env_bool("CUTOVER_IDEMPOTENCY_FAIL_OPEN") {
            config.idempotency.fail_open = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants. Called by `from_env`; explicit
    /// constructors should call it too.
    pub fn validate(&self) -> Result<(), CutoverError> {
        let r = &self.retrieval;
        if !(0.0..=1.0).contains(&r.shadow_sample_rate) {
            return Err(CutoverError::Configuration(format!(
                "shadow_sample_rate must be within [0.0, 1.0], got {}",
                r.shadow_sample_rate
            )));
        }
        if r.circuit_failure_threshold == 0 {
            return Err(CutoverError::Configuration(
                "circuit_failure_threshold must be at least 1".to_string(),
            ));
        }
        if r.outbox_max_items == 0 {
            return Err(CutoverError::Configuration(
                "outbox_max_items must be at least 1".to_string(),
            ));
        }
        if r.shadow_workers == 0 || r.shadow_queue_depth == 0 {
            return Err(CutoverError::Configuration(
                "shadow_workers and shadow_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.idempotency.ttl_s == 0 {
            return Err(CutoverError::Configuration(
                "idempotency ttl_s must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| TRUE_VALUES.contains(&v.trim().to_lowercase().as_str()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, CutoverError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            CutoverError::Configuration(format!("invalid value for {key}: {raw:?}"))
        }),
        Err(_) => Ok(None),
    }
}
