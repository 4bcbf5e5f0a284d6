//! Reconciliation primitives.
//!
//! Helpers shared by the schedulers that converge an application's desired
//! state onto the orchestration backend:
//!
//! - **Canonical documents**: byte-stable JSON rendering, so that compiling
//!   the same desired state twice yields the same document.
//! - **Topology diffs**: which process types must be torn down.
//! - **Backoff**: increasing poll intervals for wait loops.
//!
//! # Invariants
//!
//! - Rendering is deterministic given the same input value
//! - Diffs are ordered, so teardown order is reproducible

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Short digest of a canonical document, for logs and quick equality checks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentHash(String);

impl DocumentHash {
    /// Hash a document that is already canonical. Keeps 128 bits of SHA-256.
    pub fn from_canonical(canonical: &str) -> Self {
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Render `value` as compact JSON with object keys in byte order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already display as compact JSON.
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Process types that are live but no longer desired.
///
/// Returns `current − desired`, sorted and deduplicated.
pub fn removed_types<C, D>(current: C, desired: D) -> Vec<String>
where
    C: IntoIterator,
    C::Item: Into<String>,
    D: IntoIterator,
    D::Item: AsRef<str>,
{
    let desired: BTreeSet<String> = desired
        .into_iter()
        .map(|t| t.as_ref().to_string())
        .collect();

    current
        .into_iter()
        .map(Into::into)
        .filter(|t| !desired.contains(t))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Exponential backoff for poll loops.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    factor: u32,
}

impl Backoff {
    /// Create a backoff starting at `initial`, doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
            factor: 2,
        }
    }

    /// Return the next delay and advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.factor)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }
}

/// Default initial poll interval for wait loops.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default poll interval ceiling.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(20);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_hash_ignores_key_order() {
        let left =
            DocumentHash::from_canonical(&canonical_json(&serde_json::json!({"b": 2, "a": 1})));
        let right =
            DocumentHash::from_canonical(&canonical_json(&serde_json::json!({"a": 1, "b": 2})));

        assert_eq!(left, right);
        assert_eq!(left.as_str().len(), "sha256:".len() + 32);
    }

    #[test]
    fn test_canonical_json_sorted_and_compact() {
        let json = serde_json::json!({"z": [1, {"b": "x", "a": null}], "a": true});
        assert_eq!(
            canonical_json(&json),
            r#"{"a":true,"z":[1,{"a":null,"b":"x"}]}"#
        );
    }

    #[test]
    fn test_canonical_json_escapes() {
        let json = serde_json::json!({"k": "line\n\"quoted\""});
        assert_eq!(canonical_json(&json), r#"{"k":"line\n\"quoted\""}"#);
    }

    #[test]
    fn test_removed_types() {
        let removed = removed_types(
            vec!["worker".to_string(), "web".to_string(), "clock".to_string()],
            ["web"],
        );
        assert_eq!(removed, vec!["clock".to_string(), "worker".to_string()]);
    }

    #[test]
    fn test_removed_types_nothing_live() {
        let removed = removed_types(Vec::<String>::new(), ["web"]);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    }
}
