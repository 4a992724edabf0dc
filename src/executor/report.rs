//! Execution report types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::graph::ResourceId;
use crate::planner::{OperationKind, PlanMode};

/// Lifecycle of a single operation during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for dependencies.
    Pending,
    /// Handed to a worker.
    InFlight,
    /// Finished and committed.
    Succeeded,
    /// The provider call or the state commit failed.
    Failed,
    /// A dependency failed or was skipped.
    Skipped,
    /// Never scheduled, or left between retries, because the run was cancelled.
    Cancelled,
}

/// Change to a state record made by one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Content hash before the operation.
    pub before_hash: Option<String>,
    /// Content hash after the operation; `None` once deleted.
    pub after_hash: Option<String>,
    /// Provider identifier of the resource.
    pub external_id: Option<String>,
}

/// Final result of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    /// Position in the plan.
    pub index: usize,
    /// Target resource.
    pub id: ResourceId,
    /// Planned operation kind.
    pub kind: OperationKind,
    /// Terminal status.
    pub status: OperationStatus,
    /// Provider calls made.
    pub attempts: u32,
    /// Wall-clock time spent in the worker.
    pub duration_ms: u64,
    /// Record change, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<StateDelta>,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every operation succeeded.
    Success,
    /// At least one operation failed or was skipped.
    PartialFailure,
    /// Cancellation or the run timeout left operations undone.
    Cancelled,
}

/// Everything that happened during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Mode of the executed plan.
    pub mode: PlanMode,
    /// Overall status.
    pub status: RunStatus,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// One entry per plan operation, in plan order.
    pub outcomes: Vec<OperationOutcome>,
}

impl OperationStatus {
    /// Returns true once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::InFlight)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InFlight => "in flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialFailure => write!(f, "partial failure"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl OperationOutcome {
    pub(crate) const fn pending(index: usize, id: ResourceId, kind: OperationKind) -> Self {
        Self {
            index,
            id,
            kind,
            status: OperationStatus::Pending,
            attempts: 0,
            duration_ms: 0,
            delta: None,
            error: None,
        }
    }
}

impl ExecutionReport {
    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Returns the outcome for `id`.
    #[must_use]
    pub fn outcome(&self, id: &ResourceId) -> Option<&OperationOutcome> {
        self.outcomes.iter().find(|o| &o.id == id)
    }

    /// Returns the status of every operation, in plan order.
    #[must_use]
    pub fn statuses(&self) -> Vec<OperationStatus> {
        self.outcomes.iter().map(|o| o.status).collect()
    }

    /// Counts outcomes with the given status.
    #[must_use]
    pub fn count(&self, status: OperationStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Total duration of the run in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({}):", self.status, self.mode)?;
        for outcome in &self.outcomes {
            write!(
                f,
                "  {} {} {}",
                outcome.kind.symbol(),
                outcome.id,
                outcome.status
            )?;
            if let Some(error) = &outcome.error {
                write!(f, ": {error}")?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "{} succeeded, {} failed, {} skipped, {} cancelled",
            self.count(OperationStatus::Succeeded),
            self.count(OperationStatus::Failed),
            self.count(OperationStatus::Skipped),
            self.count(OperationStatus::Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts_and_lookup() {
        let mut ok = OperationOutcome::pending(0, ResourceId::new("svc", "a"), OperationKind::Create);
        ok.status = OperationStatus::Succeeded;
        let mut failed = OperationOutcome::pending(1, ResourceId::new("svc", "b"), OperationKind::Update);
        failed.status = OperationStatus::Failed;
        failed.error = Some(String::from("permanent provider failure: denied"));

        let now = Utc::now();
        let report = ExecutionReport {
            mode: PlanMode::Apply,
            status: RunStatus::PartialFailure,
            started_at: now,
            finished_at: now,
            outcomes: vec![ok, failed],
        };

        assert!(!report.is_success());
        assert_eq!(report.count(OperationStatus::Failed), 1);
        assert_eq!(
            report.outcome(&ResourceId::new("svc", "b")).map(|o| o.status),
            Some(OperationStatus::Failed)
        );
        let text = report.to_string();
        assert!(text.contains("Run partial failure (apply)"));
        assert!(text.contains("svc.b failed: permanent provider failure: denied"));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RunStatus::PartialFailure).unwrap(),
            "\"partial_failure\""
        );
        assert!(OperationStatus::Skipped.is_terminal());
        assert!(!OperationStatus::InFlight.is_terminal());
    }
}
