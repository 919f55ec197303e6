//! # Shared Atomic Key-Value Store
//!
//! Narrow interface over the crash-durable store shared by all worker
//! instances for idempotency records. Components take the store by `Arc`
//! injection so tests and single-instance deployments run on the in-memory
//! implementation while production points at a distributed one.
//!
//! The only primitive the guard depends on is a conditional write with TTL
//! ("set if absent"), the same contract as Redis `SET NX EX`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::time::Duration;

use crate::error::DispatchError;

/// Atomic key-value operations with TTL semantics.
#[async_trait]
pub trait AtomicKvStore: Send + Sync {
    /// Store `value` under `key` only if the key is absent (or expired).
    /// Returns `true` if this caller won the write.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, DispatchError>;

    /// Fetch the live value for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, DispatchError>;

    /// Unconditionally store `value` under `key`, preserving TTL semantics.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DispatchError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// In-memory store with lazy expiry, suitable for tests and single-instance
/// deployments. Expired entries are purged on access.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry(ttl: Duration) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero())
    }

    /// Number of live entries (expired entries excluded).
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AtomicKvStore for MemoryKvStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, DispatchError> {
        let now = Utc::now();
        let mut won = false;
        // The entry closure runs under the shard lock, making the
        // check-and-set atomic with respect to concurrent callers.
        self.entries
            .entry(key.to_string())
            .and_modify(|existing| {
                if existing.is_expired(now) {
                    *existing = Entry {
                        value: value.to_string(),
                        expires_at: Self::expiry(ttl),
                    };
                    won = true;
                }
            })
            .or_insert_with(|| {
                won = true;
                Entry {
                    value: value.to_string(),
                    expires_at: Self::expiry(ttl),
                }
            });
        Ok(won)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DispatchError> {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DispatchError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DispatchError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Store wrapper that fails every operation, for exercising the configured
/// store-unavailable policy in tests.
#[derive(Debug, Default)]
pub struct UnavailableKvStore;

#[async_trait]
impl AtomicKvStore for UnavailableKvStore {
    async fn set_if_absent(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<bool, DispatchError> {
        Err(DispatchError::store_unavailable("store offline"))
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, DispatchError> {
        Err(DispatchError::store_unavailable("store offline"))
    }

    async fn put(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), DispatchError> {
        Err(DispatchError::store_unavailable("store offline"))
    }

    async fn delete(&self, _key: &str) -> Result<(), DispatchError> {
        Err(DispatchError::store_unavailable("store offline"))
    }
}
