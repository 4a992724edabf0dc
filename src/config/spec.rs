//! Configuration specification types for the reconciliation engine.
//!
//! This module defines the structs that map to the `cairn.infra.yaml` file.
//! Resource declarations are kept generic: the engine knows nothing about a
//! particular resource-type catalog.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::graph::Declaration;

/// The root configuration structure for a cairn project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider endpoint configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<Declaration>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
    /// In-process storage, lost when the process exits.
    Memory,
}

/// Provider endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProviderConfig {
    /// Base URL of the provisioning API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, max = 600))]
    pub timeout_secs: u64,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

/// Executor tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutionConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 64))]
    pub parallelism: usize,
    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 20))]
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds.
    #[serde(default = "default_base_backoff_ms")]
    #[validate(range(min = 1))]
    pub base_backoff_ms: u64,
    /// Upper bound for a single backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    #[validate(range(min = 1))]
    pub max_backoff_ms: u64,
    /// Optional whole-run timeout in seconds.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub timeout_secs: Option<u64>,
}

// Default value functions

const fn default_parallelism() -> usize {
    4
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_request_timeout() -> u64 {
    30
}

fn default_token_env() -> String {
    String::from("CAIRN_PROVIDER_TOKEN")
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_request_timeout(),
            token_env: default_token_env(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: None,
        }
    }
}

impl InfraConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the identifiers of all declared resources, in declaration order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<String> {
        self.resources.iter().map(|r| r.id().to_string()).collect()
    }
}

impl StateBackend {
    /// Returns the backend name as written in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Memory => "memory",
        }
    }
}
