//! # Retrieval Backend Interface
//!
//! Minimal interface a search/retrieval backend must implement to take part
//! in the migration: indexing writes and top-k queries. Adapters for concrete
//! stores (FAISS-style local index, Weaviate, etc.) live outside this crate;
//! the in-memory backend here backs tests and single-node tooling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RetrievalError;

/// Mutation kind carried by a [`WriteRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Upsert,
    Delete,
}

/// A single document mutation bound for one or both backends.
///
/// `document_id` is unique per tenant and backend. The request is not
/// persisted beyond the call unless a failed target write lands it in the
/// outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub operation: WriteOperation,
    pub document_id: String,
    pub tenant: String,
    pub payload: serde_json::Value,
}

impl WriteRequest {
    pub fn upsert(
        tenant: impl Into<String>,
        document_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            operation: WriteOperation::Upsert,
            document_id: document_id.into(),
            tenant: tenant.into(),
            payload,
        }
    }

    pub fn delete(tenant: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            operation: WriteOperation::Delete,
            document_id: document_id.into(),
            tenant: tenant.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Idempotent replay key at the target: `(tenant, document_id,
    /// content_hash)`. Replaying an unchanged document is a no-op at the
    /// target, which is why replay keys on content rather than a sequence
    /// number (concurrent writers may interleave at the target).
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tenant.as_bytes());
        hasher.update(b"\x00");
        hasher.update(self.document_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(self.payload.to_string().as_bytes());
        hex_digest(&hasher.finalize())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One ranked hit from a backend query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub document_id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A retrieval query scoped to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub tenant: String,
    pub top_k: usize,
    /// Correlation id threaded through logs for this request.
    pub trace_id: String,
}

impl SearchQuery {
    pub fn new(tenant: impl Into<String>, text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            tenant: tenant.into(),
            top_k,
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Interface every participating backend implements.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Stable backend name used in logs, metrics labels, and config.
    fn name(&self) -> &str;

    /// Apply a single document mutation.
    async fn write(&self, request: &WriteRequest) -> Result<(), RetrievalError>;

    /// Return up to `top_k` results ranked by descending score.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, RetrievalError>;
}

#[derive(Debug, Clone)]
struct StoredDocument {
    payload: serde_json::Value,
    content_hash: String,
    indexed_at: DateTime<Utc>,
}

/// In-memory backend: token-overlap scoring over stored payload text.
///
/// Deduplicates replayed writes by content hash, matching the target-side
/// idempotence contract.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    documents: DashMap<(String, String), StoredDocument>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn contains(&self, tenant: &str, document_id: &str) -> bool {
        self.documents
            .contains_key(&(tenant.to_string(), document_id.to_string()))
    }

    fn score(query: &str, payload: &serde_json::Value) -> f64 {
        let text = match payload.get("text").and_then(serde_json::Value::as_str) {
            Some(text) => text.to_lowercase(),
            None => payload.to_string().to_lowercase(),
        };
        let query_tokens: Vec<&str> = query.split_whitespace().collect();
        if query_tokens.is_empty() {
            return 0.0;
        }
        let hits = query_tokens
            .iter()
            .filter(|token| text.contains(&token.to_lowercase()))
            .count();
        hits as f64 / query_tokens.len() as f64
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, request: &WriteRequest) -> Result<(), RetrievalError> {
        let key = (request.tenant.clone(), request.document_id.clone());
        match request.operation {
            WriteOperation::Upsert => {
                let hash = request.content_hash();
                if let Some(existing) = self.documents.get(&key) {
                    if existing.content_hash == hash {
                        // Unchanged replay; nothing to do.
                        return Ok(());
                    }
                }
                self.documents.insert(
                    key,
                    StoredDocument {
                        payload: request.payload.clone(),
                        content_hash: hash,
                        indexed_at: Utc::now(),
                    },
                );
            }
            WriteOperation::Delete => {
                self.documents.remove(&key);
            }
        }
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, RetrievalError> {
        let mut results: Vec<SearchResult> = self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == query.tenant)
            .map(|entry| SearchResult {
                document_id: entry.key().1.clone(),
                score: Self::score(&query.text, &entry.value().payload),
                metadata: serde_json::json!({
                    "indexed_at": entry.value().indexed_at.to_rfc3339(),
                }),
            })
            .filter(|result| result.score > 0.0)
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        results.truncate(query.top_k);
        Ok(results)
    }
}
