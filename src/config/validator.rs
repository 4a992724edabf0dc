//! Configuration validation for infrastructure declarations.
//!
//! This module checks everything that can be checked without building the
//! resource graph: naming, backend requirements, and executor limits.
//! Reference and cycle checks belong to the graph builder.

use crate::error::{CairnError, ConfigError, Result};
use std::collections::HashSet;
use tracing::debug;
use validator::Validate;

use super::spec::{
    ExecutionConfig, InfraConfig, ProjectConfig, ProviderConfig, StateBackend, StateConfig,
};
use crate::graph::{Declaration, EXTERNAL_ID_ATTRIBUTE};

/// Validator for infrastructure configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an infrastructure configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &InfraConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!(warnings = result.warnings.len(), "Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(CairnError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &InfraConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_resources(&config.resources, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Memory => {
                result.warnings.push(String::from(
                    "state.backend: memory state is discarded when the process exits",
                ));
            }
            StateBackend::Local => {}
        }
    }

    /// Validates provider configuration.
    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        fold_range_errors("provider", provider.validate(), result);

        match &provider.endpoint {
            None => result.warnings.push(String::from(
                "provider.endpoint: not set; plan works but apply and destroy will fail",
            )),
            Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                result.error(
                    "provider.endpoint",
                    format!("Endpoint must be an http(s) URL: {endpoint}"),
                );
            }
            Some(_) => {}
        }
    }

    /// Validates executor limits.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        fold_range_errors("execution", execution.validate(), result);

        if execution.max_backoff_ms < execution.base_backoff_ms {
            result.error(
                "execution.max_backoff_ms",
                format!(
                    "max_backoff_ms ({}) must not be lower than base_backoff_ms ({})",
                    execution.max_backoff_ms, execution.base_backoff_ms
                ),
            );
        }
    }

    /// Validates resource declarations.
    fn validate_resources(resources: &[Declaration], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources declared in configuration"));
            return;
        }

        for (i, decl) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_name(&decl.resource_type) {
                result.error(
                    format!("{prefix}.type"),
                    format!(
                        "Resource type '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        decl.resource_type
                    ),
                );
            }

            if !is_valid_name(&decl.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        decl.name
                    ),
                );
            }

            let mut seen_outputs = HashSet::new();
            for output in &decl.outputs {
                if !seen_outputs.insert(output) {
                    result.error(
                        format!("{prefix}.outputs"),
                        format!("Duplicate output: {output}"),
                    );
                }
                if output == EXTERNAL_ID_ATTRIBUTE {
                    result.warnings.push(format!(
                        "{prefix}.outputs: '{EXTERNAL_ID_ATTRIBUTE}' is always available and need not be listed"
                    ));
                } else if decl.attributes.contains_key(output) {
                    result.error(
                        format!("{prefix}.outputs"),
                        format!("Output '{output}' is also a declared attribute"),
                    );
                }
            }
        }
    }
}

/// Folds `validator` derive errors into the result.
fn fold_range_errors(
    section: &str,
    outcome: std::result::Result<(), validator::ValidationErrors>,
    result: &mut ValidationResult,
) {
    let Err(errors) = outcome else {
        return;
    };

    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    for (field, failures) in fields {
        for failure in failures {
            let detail = failure
                .message
                .as_ref()
                .map_or_else(|| failure.code.to_string(), ToString::to_string);
            result.error(
                format!("{section}.{field}"),
                format!("Value out of accepted range ({detail})"),
            );
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
