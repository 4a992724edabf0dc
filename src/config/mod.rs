//! Configuration module for the cairn reconciliation engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `cairn.infra.yaml`
//! - Validation of configuration values
//! - Computing content hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, ENV_PROVIDER_ENDPOINT, find_config_file};
pub use spec::{
    ExecutionConfig, InfraConfig, ProjectConfig, ProviderConfig, StateBackend, StateConfig,
};
pub use self::validator::{ConfigValidator, ValidationError, ValidationResult};
