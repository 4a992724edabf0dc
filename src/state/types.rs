//! State types for tracking applied resources.
//!
//! These types represent the recorded actual state of each resource, used for
//! planning and idempotent operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::ConfigHasher;
use crate::error::StateError;
use crate::graph::{EXTERNAL_ID_ATTRIBUTE, ResourceId};

/// Current version of the record format.
pub const STATE_VERSION: &str = "1.0";

/// The recorded state of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    /// Record format version.
    pub version: String,
    /// Resource identifier.
    pub id: ResourceId,
    /// Resolved attribute values as last applied.
    pub attributes: BTreeMap<String, Value>,
    /// Identifier assigned by the provider.
    pub external_id: String,
    /// Provider-computed attributes returned by the last apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Content hash of `attributes` at apply time.
    pub content_hash: String,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time view of every record, loaded once per run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    records: BTreeMap<ResourceId, StateRecord>,
}

impl StateRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        id: ResourceId,
        attributes: BTreeMap<String, Value>,
        external_id: impl Into<String>,
        outputs: BTreeMap<String, Value>,
        content_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            id,
            attributes,
            external_id: external_id.into(),
            outputs,
            content_hash: content_hash.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Keeps the creation time of the record this one replaces.
    #[must_use]
    pub fn replacing(mut self, prior: Option<&Self>) -> Self {
        if let Some(prior) = prior {
            self.created_at = prior.created_at;
        }
        self
    }

    /// Returns the type tag of the recorded resource.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.id.resource_type
    }

    /// Returns a provider-computed value, `id` included.
    #[must_use]
    pub fn output(&self, attribute: &str) -> Option<Value> {
        if attribute == EXTERNAL_ID_ATTRIBUTE {
            return Some(Value::String(self.external_id.clone()));
        }
        self.outputs.get(attribute).cloned()
    }

    /// Checks that the record was written by a compatible version.
    ///
    /// # Errors
    ///
    /// Returns an error if the major version differs.
    pub fn check_version(&self) -> Result<(), StateError> {
        let major = |v: &str| v.split('.').next().unwrap_or_default().to_string();
        if major(&self.version) == major(STATE_VERSION) {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            })
        }
    }
}

impl StateSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from records.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    /// Returns the record for `id`.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.records.get(id)
    }

    /// Returns true if `id` is recorded.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.records.contains_key(id)
    }

    /// Inserts or replaces a record.
    pub fn insert(&mut self, record: StateRecord) {
        self.records.insert(record.id.clone(), record);
    }

    /// Removes a record.
    pub fn remove(&mut self, id: &ResourceId) -> Option<StateRecord> {
        self.records.remove(id)
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over records in identifier order.
    pub fn records(&self) -> impl Iterator<Item = &StateRecord> {
        self.records.values()
    }

    /// Iterates over recorded identifiers in order.
    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.records.keys()
    }

    /// Fingerprint of the recorded identifiers and content hashes.
    ///
    /// Two snapshots with the same fingerprint plan identically.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        ConfigHasher::new().fingerprint(
            self.records
                .values()
                .map(|r| (r.id.to_string(), r.content_hash.as_str())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str, hash: &str) -> StateRecord {
        StateRecord::new(
            ResourceId::new("resource-group", name),
            BTreeMap::from([(String::from("location"), json!("westeurope"))]),
            format!("/subscriptions/0/resourceGroups/{name}"),
            BTreeMap::new(),
            hash,
        )
    }

    #[test]
    fn test_record_output_includes_external_id() {
        let mut rec = record("main", "h1");
        rec.outputs.insert(String::from("fqdn"), json!("main.example.net"));

        assert_eq!(rec.output("id"), Some(json!("/subscriptions/0/resourceGroups/main")));
        assert_eq!(rec.output("fqdn"), Some(json!("main.example.net")));
        assert_eq!(rec.output("missing"), None);
    }

    #[test]
    fn test_record_replacing_keeps_created_at() {
        let first = record("main", "h1");
        let second = record("main", "h2").replacing(Some(&first));
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_version_check() {
        let mut rec = record("main", "h1");
        assert!(rec.check_version().is_ok());
        rec.version = String::from("2.0");
        assert!(matches!(rec.check_version(), Err(StateError::VersionMismatch { .. })));
    }

    #[test]
    fn test_snapshot_fingerprint_tracks_hashes() {
        let a = StateSnapshot::from_records([record("a", "h1"), record("b", "h2")]);
        let b = StateSnapshot::from_records([record("b", "h2"), record("a", "h1")]);
        let c = StateSnapshot::from_records([record("a", "h1"), record("b", "h3")]);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_record_json_shape() {
        let rec = record("main", "h1");
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["id"], json!("resource-group.main"));
        assert_eq!(json["version"], json!(STATE_VERSION));
    }
}
