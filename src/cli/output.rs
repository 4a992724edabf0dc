//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, InfraConfig, ValidationResult};
use crate::executor::{ExecutionReport, OperationStatus, RunStatus};
use crate::planner::{OperationKind, Plan};
use crate::state::{LockInfo, StateRecord, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
    /// Hash shortener for tables.
    hasher: ConfigHasher,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Waits on")]
    waits_on: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Execution outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "External ID")]
    external_id: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self {
            format,
            hasher: ConfigHasher::new(),
        }
    }

    /// Returns true when output is JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => self.format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(&self, plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan ({})\n", plan.mode);
        let _ = write!(
            output,
            "   State fingerprint: {}\n\n",
            self.hasher.short_hash(&plan.state_fingerprint)
        );

        let rows: Vec<PlanRow> = plan
            .operations
            .iter()
            .map(|op| PlanRow {
                index: op.index + 1,
                action: Self::format_kind(op.kind),
                resource: op.id.to_string(),
                waits_on: op
                    .waits_on
                    .iter()
                    .map(|w| (w + 1).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                changes: match op.changes.len() {
                    0 => String::new(),
                    1 => op.changes[0].attribute.clone(),
                    n => format!("{n} attributes"),
                },
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for op in plan.operations.iter().filter(|op| !op.changes.is_empty()) {
                let _ = writeln!(output, "   {} {}", Self::format_kind(op.kind), op.id);
                for change in &op.changes {
                    let _ = writeln!(output, "       {change}");
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.delete.to_string().red(),
            summary.unchanged
        );

        output
    }

    /// Formats an execution report.
    #[must_use]
    pub fn format_report(&self, report: &ExecutionReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ExecutionReport) -> String {
        let headline = match report.status {
            RunStatus::Success => format!("{} Run succeeded", "✓".green()),
            RunStatus::PartialFailure => format!("{} Run partially failed", "✗".red()),
            RunStatus::Cancelled => format!("{} Run cancelled", "⚠".yellow()),
        };
        let mut output = format!("\n{headline} ({}, {} ms)\n\n", report.mode, report.duration_ms());

        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .map(|o| OutcomeRow {
                action: Self::format_kind(o.kind),
                resource: o.id.to_string(),
                status: Self::format_status(o.status),
                attempts: o.attempts,
                duration: format!("{} ms", o.duration_ms),
                detail: o.error.as_deref().map_or_else(
                    || {
                        o.delta
                            .as_ref()
                            .and_then(|d| d.external_id.clone())
                            .unwrap_or_default()
                    },
                    |e| truncate(e, 60),
                ),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = write!(
            output,
            "\n{} succeeded, {} failed, {} skipped, {} cancelled\n",
            report.count(OperationStatus::Succeeded).to_string().green(),
            report.count(OperationStatus::Failed).to_string().red(),
            report.count(OperationStatus::Skipped).to_string().yellow(),
            report.count(OperationStatus::Cancelled)
        );
        output
    }

    /// Formats a validation result with a short summary of the declarations.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &InfraConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        #[derive(Serialize)]
        struct ValidationJson<'a> {
            valid: bool,
            project: String,
            resources: usize,
            errors: Vec<String>,
            warnings: Vec<String>,
            state_backend: &'a str,
        }

        if self.is_json() {
            return to_json(&ValidationJson {
                valid: result.is_valid(),
                project: config.qualified_name(),
                resources: config.resources.len(),
                errors: result.errors.iter().map(ToString::to_string).collect(),
                warnings: result.warnings.iter().map(ToString::to_string).collect(),
                state_backend: config.state.backend.as_str(),
            });
        }

        let mut output = String::new();
        if result.is_valid() {
            let _ = writeln!(output, "{} Configuration is valid!", "✓".green());
        } else {
            let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
            for error in &result.errors {
                let _ = writeln!(output, "   - {error}");
            }
        }
        if show_warnings && !result.warnings.is_empty() {
            let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
            for warning in &result.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }

        output.push_str("\nConfiguration summary:\n");
        let _ = writeln!(output, "   Project: {}", config.qualified_name());
        let _ = writeln!(output, "   State backend: {}", config.state.backend.as_str());
        let _ = writeln!(output, "   Resources: {}", config.resources.len());
        output
    }

    /// Formats every recorded resource.
    #[must_use]
    pub fn format_state_list(&self, snapshot: &StateSnapshot) -> String {
        if self.is_json() {
            return to_json(&snapshot.records().collect::<Vec<_>>());
        }
        if snapshot.is_empty() {
            return String::from("No resources recorded.\n");
        }

        let rows: Vec<RecordRow> = snapshot
            .records()
            .map(|r| RecordRow {
                resource: r.id.to_string(),
                external_id: truncate(&r.external_id, 40),
                hash: self.hasher.short_hash(&r.content_hash),
                updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            })
            .collect();
        let mut output = Table::new(rows).to_string();
        let _ = write!(output, "\n\n{} resources recorded\n", snapshot.len());
        output
    }

    /// Formats one recorded resource.
    #[must_use]
    pub fn format_record(&self, record: &StateRecord) -> String {
        if self.is_json() {
            return to_json(record);
        }

        let mut output = format!("\n{}\n\n", record.id.to_string().bold());
        let _ = writeln!(output, "   External ID: {}", record.external_id);
        let _ = writeln!(output, "   Content hash: {}", record.content_hash);
        let _ = writeln!(output, "   Version: {}", record.version);
        let _ = writeln!(output, "   Created: {}", record.created_at);
        let _ = writeln!(output, "   Updated: {}", record.updated_at);

        output.push_str("\n   Attributes:\n");
        for (name, value) in &record.attributes {
            let _ = writeln!(output, "     {name} = {value}");
        }
        if !record.outputs.is_empty() {
            output.push_str("\n   Outputs:\n");
            for (name, value) in &record.outputs {
                let _ = writeln!(output, "     {name} = {value}");
            }
        }
        output
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        if self.is_json() {
            return to_json(lock);
        }
        format!(
            "State locked: {} (holder: {}, operation: {}, expires in {}s)\n",
            lock.lock_id,
            lock.holder,
            lock.operation,
            lock.remaining_secs()
        )
    }

    /// Formats a one-line confirmation message.
    #[must_use]
    pub fn format_message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": "success", "message": message })),
            OutputFormat::Text => format!("{} {message}\n", "✓".green()),
        }
    }

    /// Formats an operation kind with color.
    fn format_kind(kind: OperationKind) -> String {
        match kind {
            OperationKind::Create => "+create".green().to_string(),
            OperationKind::Update => "~update".yellow().to_string(),
            OperationKind::Delete => "-delete".red().to_string(),
            OperationKind::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Formats an operation status with color.
    fn format_status(status: OperationStatus) -> String {
        match status {
            OperationStatus::Succeeded => "succeeded".green().to_string(),
            OperationStatus::Failed => "failed".red().to_string(),
            OperationStatus::Skipped => "skipped".yellow().to_string(),
            OperationStatus::Cancelled => "cancelled".yellow().to_string(),
            OperationStatus::Pending | OperationStatus::InFlight => status.to_string().dimmed().to_string(),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
