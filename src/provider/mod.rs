//! Provider abstraction.
//!
//! A provider performs the actual create/update/delete calls against the
//! infrastructure API. Implementations must tolerate concurrent calls and
//! report every failure as transient or permanent; retrying is the
//! executor's job.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::graph::ResourceId;

pub use http::HttpProvider;

/// A fully resolved create-or-update request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Target resource.
    pub id: ResourceId,
    /// Provider identifier when the resource already exists.
    pub external_id: Option<String>,
    /// Desired attribute values, all known.
    pub attributes: BTreeMap<String, Value>,
}

/// What the provider reports back after a successful create or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutput {
    /// Identifier assigned by the provider.
    pub external_id: String,
    /// Provider-computed attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// Infrastructure provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates the resource, or updates it when `external_id` is set.
    async fn create_or_update(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProviderOutput, ProviderError>;

    /// Deletes the resource. Deleting something already gone succeeds.
    async fn delete(&self, id: &ResourceId, external_id: &str) -> Result<(), ProviderError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

impl ProviderOutput {
    /// Creates an output with no computed attributes.
    #[must_use]
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds a computed attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}
