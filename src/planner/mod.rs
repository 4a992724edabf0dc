//! Planning module for reconciliation runs.
//!
//! This module compares the desired graph with the recorded state and
//! produces an ordered plan of create, update, delete, and no-op operations.

mod diff;
mod plan;

pub use diff::{Planner, diff_attributes};
pub use plan::{AttributeChange, Operation, OperationKind, Plan, PlanMode, PlanSummary};
