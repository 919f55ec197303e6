//! # Canonical Task-Invocation Keys
//!
//! Deterministic, order-invariant keys for deduplicating task executions.
//! Task arguments are normalized into a closed, tagged value tree before
//! serialization, so behavior is total and reproducible: every recognized
//! shape has a defined encoding and everything else falls back to its
//! canonical string form.
//!
//! The property under test is that two logically-equal invocations that
//! differ only in incidental ordering (map key order, set iteration order)
//! produce the identical key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Closed set of shapes recognized by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Binary payloads get a fixed text encoding (base64).
    Binary(Vec<u8>),
    /// Timestamps are normalized to UTC at millisecond precision.
    Timestamp(DateTime<Utc>),
    /// Ordered sequence; element order is significant.
    Seq(Vec<CanonicalValue>),
    /// Unordered collection; elements are sorted by their encoding.
    Set(Vec<CanonicalValue>),
    /// Nested structure; keys are sorted.
    Map(BTreeMap<String, CanonicalValue>),
}

impl CanonicalValue {
    /// Build an unordered collection. Iteration order of the input is
    /// irrelevant; elements are sorted by their canonical encoding.
    pub fn set(elements: Vec<CanonicalValue>) -> Self {
        Self::Set(elements)
    }

    /// Normalize a timestamp to UTC.
    pub fn timestamp<Tz: chrono::TimeZone>(value: DateTime<Tz>) -> Self {
        Self::Timestamp(value.with_timezone(&Utc))
    }

    /// Fallback branch for values without a defined normalization: their
    /// canonical string form.
    pub fn fallback(value: impl std::fmt::Display) -> Self {
        Self::Text(value.to_string())
    }

    /// Normalize a JSON value tree. Maps sort by key; arrays stay ordered;
    /// strings that parse as RFC 3339 timestamps normalize to UTC.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(parsed) => Self::Timestamp(parsed.with_timezone(&Utc)),
                Err(_) => Self::Text(s.clone()),
            },
            serde_json::Value::Array(items) => {
                Self::Seq(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(key, item)| (key.clone(), Self::from_json(item)))
                    .collect(),
            ),
        }
    }

    /// Stable serialized form with canonical separators. Recursive, with
    /// sorted map keys and sorted set elements.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut String) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Int(i) => out.push_str(&i.to_string()),
            Self::Float(f) => {
                if f.is_finite() {
                    // Integral floats encode like ints so 2.0 and 2 agree.
                    if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
                        out.push_str(&format!("{}", *f as i64));
                    } else {
                        out.push_str(&format!("{f}"));
                    }
                } else {
                    out.push_str("null");
                }
            }
            Self::Text(s) => {
                out.push('"');
                out.push_str(&s.replace('\\', "\\\\").replace('"', "\\\""));
                out.push('"');
            }
            Self::Binary(bytes) => {
                out.push_str("b64:");
                out.push_str(&BASE64.encode(bytes));
            }
            Self::Timestamp(ts) => {
                out.push_str("ts:");
                out.push_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true));
            }
            Self::Seq(items) => {
                out.push('[');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    item.encode_into(out);
                }
                out.push(']');
            }
            Self::Set(items) => {
                let mut encoded: Vec<String> = items.iter().map(Self::encode).collect();
                encoded.sort();
                encoded.dedup();
                out.push('{');
                for (index, item) in encoded.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    out.push_str(item);
                }
                out.push('}');
            }
            Self::Map(map) => {
                out.push('(');
                for (index, (key, item)) in map.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    out.push('"');
                    out.push_str(&key.replace('\\', "\\\\").replace('"', "\\\""));
                    out.push_str("\":");
                    item.encode_into(out);
                }
                out.push(')');
            }
        }
    }
}

/// Canonical deduplication key for a task invocation, following the
/// `task:{name}:{digest}` rule.
pub fn canonical_key(
    task_name: &str,
    args: &[CanonicalValue],
    kwargs: &BTreeMap<String, CanonicalValue>,
) -> String {
    let mut encoded = String::new();
    encoded.push_str("task=");
    encoded.push_str(task_name);
    encoded.push_str(";args=");
    CanonicalValue::Seq(args.to_vec()).encode_into(&mut encoded);
    encoded.push_str(";kwargs=");
    CanonicalValue::Map(kwargs.clone()).encode_into(&mut encoded);

    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    let digest: String = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("task:{task_name}:{digest}")
}

/// Convenience wrapper for JSON-shaped invocations: positional args as a
/// JSON array, keyword args as a JSON object.
pub fn canonical_key_json(
    task_name: &str,
    args: &serde_json::Value,
    kwargs: &serde_json::Value,
) -> String {
    let args = match CanonicalValue::from_json(args) {
        CanonicalValue::Seq(items) => items,
        CanonicalValue::Null => Vec::new(),
        other => vec![other],
    };
    let kwargs = match CanonicalValue::from_json(kwargs) {
        CanonicalValue::Map(map) => map,
        _ => BTreeMap::new(),
    };
    canonical_key(task_name, &args, &kwargs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn map_key_order_does_not_change_key() {
        let a = serde_json::json!({"chart_id": "c1", "user": "u1"});
        let b: serde_json::Value =
            serde_json::from_str(r#"{"user": "u1", "chart_id": "c1"}"#).unwrap();
        assert_eq!(
            canonical_key_json("render_pdf", &serde_json::json!([]), &a),
            canonical_key_json("render_pdf", &serde_json::json!([]), &b),
        );
    }

    #[test]
    fn set_iteration_order_does_not_change_key() {
        let forward = CanonicalValue::set(vec![
            CanonicalValue::Text("a".into()),
            CanonicalValue::Text("b".into()),
            CanonicalValue::Text("c".into()),
        ]);
        let reversed = CanonicalValue::set(vec![
            CanonicalValue::Text("c".into()),
            CanonicalValue::Text("b".into()),
            CanonicalValue::Text("a".into()),
        ]);
        assert_eq!(forward.encode(), reversed.encode());
    }

    #[test]
    fn sequence_order_is_significant() {
        let ab = CanonicalValue::Seq(vec![
            CanonicalValue::Int(1),
            CanonicalValue::Int(2),
        ]);
        let ba = CanonicalValue::Seq(vec![
            CanonicalValue::Int(2),
            CanonicalValue::Int(1),
        ]);
        assert_ne!(ab.encode(), ba.encode());
    }

    #[test]
    fn timestamps_normalize_across_timezones() {
        let utc = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let offset = utc.with_timezone(&chrono::FixedOffset::east_opt(5 * 3600).unwrap());
        assert_eq!(
            CanonicalValue::timestamp(utc).encode(),
            CanonicalValue::timestamp(offset).encode(),
        );
    }

    #[test]
    fn rfc3339_strings_are_recognized_as_timestamps() {
        let a = serde_json::json!({"at": "2024-06-01T12:00:00+05:00"});
        let b = serde_json::json!({"at": "2024-06-01T07:00:00Z"});
        assert_eq!(
            canonical_key_json("t", &serde_json::json!([]), &a),
            canonical_key_json("t", &serde_json::json!([]), &b),
        );
    }

    #[test]
    fn binary_uses_fixed_base64_encoding() {
        let value = CanonicalValue::Binary(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(value.encode(), "b64:3q2+7w==");
    }

    #[test]
    fn integral_floats_agree_with_ints() {
        assert_eq!(
            CanonicalValue::Float(2.0).encode(),
            CanonicalValue::Int(2).encode(),
        );
    }

    #[test]
    fn different_tasks_produce_different_keys() {
        let empty = BTreeMap::new();
        assert_ne!(
            canonical_key("render_pdf", &[], &empty),
            canonical_key("send_email", &[], &empty),
        );
    }

    #[test]
    fn key_follows_task_prefix_rule() {
        let key = canonical_key("render_pdf", &[], &BTreeMap::new());
        assert!(key.starts_with("task:render_pdf:"));
    }

    proptest! {
        /// Any permutation of map entries yields the identical key.
        #[test]
        fn canonical_key_is_order_invariant(
            entries in proptest::collection::vec(("[a-z]{1,8}", 0i64..1000), 1..8),
            seed in 0usize..1000,
        ) {
            let kwargs: BTreeMap<String, CanonicalValue> = entries
                .iter()
                .map(|(k, v)| (k.clone(), CanonicalValue::Int(*v)))
                .collect();

            // Insert in a rotated order; BTreeMap + sorted encoding must
            // erase the difference.
            let mut rotated_entries = entries.clone();
            if !rotated_entries.is_empty() {
                let len = rotated_entries.len();
                rotated_entries.rotate_left(seed % len);
            }
            let rotated: BTreeMap<String, CanonicalValue> = rotated_entries
                .iter()
                .map(|(k, v)| (k.clone(), CanonicalValue::Int(*v)))
                .collect();

            prop_assert_eq!(
                canonical_key("t", &[], &kwargs),
                canonical_key("t", &[], &rotated)
            );
        }

        /// Set encoding is invariant under permutation of its elements.
        #[test]
        fn set_encoding_is_permutation_invariant(
            values in proptest::collection::vec(0i64..100, 1..10),
            seed in 0usize..1000,
        ) {
            let forward: Vec<CanonicalValue> =
                values.iter().copied().map(CanonicalValue::Int).collect();
            let mut shuffled = values.clone();
            let len = shuffled.len();
            shuffled.rotate_left(seed % len);
            let rotated: Vec<CanonicalValue> =
                shuffled.into_iter().map(CanonicalValue::Int).collect();

            prop_assert_eq!(
                CanonicalValue::set(forward).encode(),
                CanonicalValue::set(rotated).encode()
            );
        }
    }
}
