//! Content hashing for change detection.
//!
//! This module provides deterministic hashing of resolved resource
//! attributes so that unchanged resources plan as no-ops, and a fingerprint
//! of the recorded state so that a stale plan is detected before execution.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hasher for computing content hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the content hash of a resource's resolved attributes.
    ///
    /// Object keys are hashed in sorted order at every depth, so two maps
    /// with the same entries always hash the same.
    #[must_use]
    pub fn hash_resource(&self, resource_type: &str, attributes: &BTreeMap<String, Value>) -> String {
        let mut canonical = String::new();
        canonical.push('{');
        for (i, (key, value)) in attributes.iter().enumerate() {
            if i > 0 {
                canonical.push(',');
            }
            write_json_string(key, &mut canonical);
            canonical.push(':');
            write_canonical(value, &mut canonical);
        }
        canonical.push('}');

        let mut hasher = Sha256::new();
        hasher.update(resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes a fingerprint over `(identifier, content hash)` pairs.
    ///
    /// Pairs are sorted first, so iteration order does not matter.
    #[must_use]
    pub fn fingerprint<I, K, H>(&self, entries: I) -> String
    where
        I: IntoIterator<Item = (K, H)>,
        K: AsRef<str>,
        H: AsRef<str>,
    {
        let mut pairs: Vec<(String, String)> = entries
            .into_iter()
            .map(|(k, h)| (k.as_ref().to_string(), h.as_ref().to_string()))
            .collect();
        pairs.sort();

        let mut hasher = Sha256::new();
        for (id, hash) in &pairs {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
            hasher.update(hash.as_bytes());
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Constant-time comparison
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
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
                write_json_string(key, out);
                out.push(':');
                if let Some(item) = map.get(key) {
                    write_canonical(item, out);
                }
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}
