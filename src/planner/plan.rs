//! Plan types.
//!
//! A plan is an immutable, ordered list of operations. Operation `i` may only
//! wait on operations with a smaller index, so executing in index order with
//! a single worker is always valid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::graph::{AttributeValue, ResourceId};
use crate::state::StateRecord;

/// Whether the plan converges resources toward the declarations or removes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    /// Create, update, or keep declared resources.
    Apply,
    /// Delete every recorded resource.
    Destroy,
}

/// What an operation does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// The resource is not recorded yet.
    Create,
    /// The recorded resource differs from the declaration.
    Update,
    /// The recorded resource must go.
    Delete,
    /// Nothing to do.
    NoOp,
}

/// One attribute-level difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Recorded value, if any.
    pub old: Option<Value>,
    /// Desired value, if known.
    pub new: Option<Value>,
    /// The desired value depends on a value produced during execution.
    #[serde(default)]
    pub known_after_apply: bool,
}

/// A single planned operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Position in the plan.
    pub index: usize,
    /// Target resource.
    pub id: ResourceId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Attribute-level changes (empty for no-ops and deletes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
    /// Desired attribute values after plan-time substitution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub desired: BTreeMap<String, AttributeValue>,
    /// Content hash of `desired`, when every value is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_hash: Option<String>,
    /// Content hash currently recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    /// Provider identifier of the recorded resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// The record this operation replaces or removes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<StateRecord>,
    /// Operations that must succeed first.
    #[serde(default)]
    pub waits_on: Vec<usize>,
}

/// A complete plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan mode.
    pub mode: PlanMode,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Operations in execution order.
    pub operations: Vec<Operation>,
    /// Fingerprint of the state snapshot the plan was computed from.
    pub state_fingerprint: String,
}

/// Operation counts by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Creates.
    pub create: usize,
    /// Updates.
    pub update: usize,
    /// Deletes.
    pub delete: usize,
    /// No-ops.
    pub unchanged: usize,
}

impl OperationKind {
    /// Returns the diff symbol for this kind.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

impl AttributeChange {
    /// Creates a change between two known values.
    #[must_use]
    pub const fn known(attribute: String, old: Option<Value>, new: Option<Value>) -> Self {
        Self {
            attribute,
            old,
            new,
            known_after_apply: false,
        }
    }

    /// Creates a change whose new value is only known after apply.
    #[must_use]
    pub const fn deferred(attribute: String, old: Option<Value>) -> Self {
        Self {
            attribute,
            old,
            new: None,
            known_after_apply: true,
        }
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map_or_else(|| String::from("(none)"), Value::to_string);
        if self.known_after_apply {
            write!(f, "{}: {} -> (known after apply)", self.attribute, show(&self.old))
        } else {
            write!(f, "{}: {} -> {}", self.attribute, show(&self.old), show(&self.new))
        }
    }
}

impl Operation {
    /// Returns true if any desired value is still deferred.
    #[must_use]
    pub fn has_deferred(&self) -> bool {
        self.desired.values().any(AttributeValue::is_deferred)
    }

    /// Returns true if the operation calls the provider.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.kind != OperationKind::NoOp
    }

    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            OperationKind::Create => format!("Create {}", self.id),
            OperationKind::Update => format!("Update {}", self.id),
            OperationKind::Delete => format!("Delete {}", self.id),
            OperationKind::NoOp => format!("No change for {}", self.id),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.symbol(), self.id)
    }
}

impl Plan {
    /// Returns true if no operation changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.operations.iter().any(Operation::is_change)
    }

    /// Returns the number of operations.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns operation counts by kind.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match op.kind {
                OperationKind::Create => summary.create += 1,
                OperationKind::Update => summary.update += 1,
                OperationKind::Delete => summary.delete += 1,
                OperationKind::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Returns the kinds of all operations, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<OperationKind> {
        self.operations.iter().map(|op| op.kind).collect()
    }

    /// Returns the operation targeting `id`.
    #[must_use]
    pub fn operation_for(&self, id: &ResourceId) -> Option<&Operation> {
        self.operations.iter().find(|op| &op.id == id)
    }

    /// Returns, for each operation, the operations waiting on it.
    #[must_use]
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.operations.len()];
        for op in &self.operations {
            for &dep in &op.waits_on {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(op.index);
                }
            }
        }
        dependents
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.unchanged
        )
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({}, {} operations):", self.mode, self.operations.len())?;
        for op in &self.operations {
            writeln!(f, "  {op}")?;
            for change in &op.changes {
                writeln!(f, "      {change}")?;
            }
        }
        write!(f, "{}", self.summary())
    }
}
