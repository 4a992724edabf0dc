//! Planner: diffs the desired graph against recorded state.
//!
//! Apply plans follow topological order; destroy plans follow its reverse.
//! Values a dependency only learns once it has executed (its external id,
//! provider outputs) are left deferred and resolved by the executor.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use chrono::Utc;

use crate::config::ConfigHasher;
use crate::error::PlanError;
use crate::graph::{AttributeValue, Reference, Resource, ResourceGraph, template};
use crate::state::{StateRecord, StateSnapshot};

use super::plan::{AttributeChange, Operation, OperationKind, Plan, PlanMode};

/// Computes plans from a graph and a state snapshot.
#[derive(Debug, Default)]
pub struct Planner {
    hasher: ConfigHasher,
}

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes a plan.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InconsistentState`] if the snapshot records
    /// resources the graph does not declare, and
    /// [`PlanError::CycleDetected`] if the graph cannot be ordered.
    pub fn plan(
        &self,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
        mode: PlanMode,
    ) -> Result<Plan, PlanError> {
        Self::check_orphans(graph, snapshot)?;

        let order = graph.topological_order().map_err(|remaining| PlanError::CycleDetected {
            remaining: remaining
                .iter()
                .filter_map(|&i| graph.resource(i))
                .map(|r| r.id.to_string())
                .collect(),
        })?;

        let operations = match mode {
            PlanMode::Apply => self.plan_apply(graph, snapshot, &order)?,
            PlanMode::Destroy => Self::plan_destroy(graph, snapshot, &order),
        };

        let plan = Plan {
            mode,
            created_at: Utc::now(),
            operations,
            state_fingerprint: snapshot.fingerprint(),
        };

        let summary = plan.summary();
        info!(
            mode = %mode,
            create = summary.create,
            update = summary.update,
            delete = summary.delete,
            unchanged = summary.unchanged,
            "Plan computed"
        );
        Ok(plan)
    }

    /// Fails if the snapshot holds records for undeclared resources.
    fn check_orphans(graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<(), PlanError> {
        let orphans: Vec<String> = snapshot
            .ids()
            .filter(|id| !graph.contains(id))
            .map(ToString::to_string)
            .collect();

        if orphans.is_empty() {
            Ok(())
        } else {
            Err(PlanError::InconsistentState { orphans })
        }
    }

    fn plan_apply(
        &self,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
        order: &[usize],
    ) -> Result<Vec<Operation>, PlanError> {
        let mut planned: Vec<Option<Operation>> = vec![None; graph.len()];
        let mut position = vec![0usize; graph.len()];

        for (pos, &idx) in order.iter().enumerate() {
            let Some(resource) = graph.resource(idx) else {
                continue;
            };
            position[idx] = pos;

            let prior = snapshot.get(&resource.id).cloned();
            let desired = Self::resolve_desired(graph, resource, &planned)?;
            let (kind, changes, planned_hash) = self.classify(resource, &desired, prior.as_ref());

            let mut waits_on: Vec<usize> =
                graph.dependencies(idx).iter().map(|&d| position[d]).collect();
            waits_on.sort_unstable();

            debug!(resource = %resource.id, kind = %kind, "Planned operation");
            planned[idx] = Some(Operation {
                index: pos,
                id: resource.id.clone(),
                kind,
                changes,
                desired,
                planned_hash,
                previous_hash: prior.as_ref().map(|r| r.content_hash.clone()),
                external_id: prior.as_ref().map(|r| r.external_id.clone()),
                prior,
                waits_on,
            });
        }

        Ok(order.iter().filter_map(|&idx| planned[idx].take()).collect())
    }

    /// Substitutes every reference that is known at plan time.
    fn resolve_desired(
        graph: &ResourceGraph,
        resource: &Resource,
        planned: &[Option<Operation>],
    ) -> Result<BTreeMap<String, AttributeValue>, PlanError> {
        let lookup = |reference: &Reference| -> Option<Value> {
            let target_idx = graph.index_of(&reference.target)?;
            let target_op = planned.get(target_idx).and_then(Option::as_ref)?;
            let target = graph.resource(target_idx)?;

            if target.is_declared(&reference.attribute) {
                return target_op
                    .desired
                    .get(&reference.attribute)
                    .and_then(AttributeValue::known)
                    .cloned();
            }

            // Computed values are only trustworthy when the target is unchanged
            if target_op.kind != OperationKind::NoOp {
                return None;
            }
            let value = target_op
                .prior
                .as_ref()
                .and_then(|record| record.output(&reference.attribute));
            if value.is_none() {
                warn!(
                    reference = %reference,
                    "Recorded state has no value for output; substituting null"
                );
            }
            Some(value.unwrap_or(Value::Null))
        };

        resource
            .attributes
            .iter()
            .map(|(name, raw)| {
                template::resolve(raw, &lookup)
                    .map(|value| (name.clone(), value))
                    .map_err(|e| PlanError::InvalidAttribute {
                        id: resource.id.to_string(),
                        attribute: name.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    fn classify(
        &self,
        resource: &Resource,
        desired: &BTreeMap<String, AttributeValue>,
        prior: Option<&StateRecord>,
    ) -> (OperationKind, Vec<AttributeChange>, Option<String>) {
        let known: Option<BTreeMap<String, Value>> = desired
            .iter()
            .map(|(name, value)| value.known().map(|v| (name.clone(), v.clone())))
            .collect();
        let planned_hash = known
            .as_ref()
            .map(|attrs| self.hasher.hash_resource(&resource.id.resource_type, attrs));

        match prior {
            None => (
                OperationKind::Create,
                diff_attributes(&BTreeMap::new(), desired),
                planned_hash,
            ),
            Some(record) => match &planned_hash {
                Some(hash) if ConfigHasher::hashes_match(hash, &record.content_hash) => {
                    (OperationKind::NoOp, Vec::new(), planned_hash)
                }
                _ => (
                    OperationKind::Update,
                    diff_attributes(&record.attributes, desired),
                    planned_hash,
                ),
            },
        }
    }

    fn plan_destroy(graph: &ResourceGraph, snapshot: &StateSnapshot, order: &[usize]) -> Vec<Operation> {
        let mut position: Vec<Option<usize>> = vec![None; graph.len()];
        // For a resource with nothing to delete: the deletes it stands in for
        let mut frontier: Vec<Vec<usize>> = vec![Vec::new(); graph.len()];
        let mut operations: Vec<Operation> = Vec::new();

        for &idx in order.iter().rev() {
            let mut waits = BTreeSet::new();
            for &dependent in graph.dependents(idx) {
                match position[dependent] {
                    Some(pos) => {
                        waits.insert(pos);
                    }
                    None => waits.extend(frontier[dependent].iter().copied()),
                }
            }

            let Some(resource) = graph.resource(idx) else {
                continue;
            };
            let Some(record) = snapshot.get(&resource.id) else {
                frontier[idx] = waits.into_iter().collect();
                continue;
            };

            let index = operations.len();
            position[idx] = Some(index);
            operations.push(Operation {
                index,
                id: resource.id.clone(),
                kind: OperationKind::Delete,
                changes: Vec::new(),
                desired: BTreeMap::new(),
                planned_hash: None,
                previous_hash: Some(record.content_hash.clone()),
                external_id: Some(record.external_id.clone()),
                prior: Some(record.clone()),
                waits_on: waits.into_iter().collect(),
            });
        }

        operations
    }
}

/// Attribute-level differences between a record and the desired values.
///
/// Removed keys appear with `new: None`.
#[must_use]
pub fn diff_attributes(
    recorded: &BTreeMap<String, Value>,
    desired: &BTreeMap<String, AttributeValue>,
) -> Vec<AttributeChange> {
    let mut changes = Vec::new();

    for (name, value) in desired {
        let old = recorded.get(name).cloned();
        match value {
            AttributeValue::Known(new) => {
                if old.as_ref() != Some(new) {
                    changes.push(AttributeChange::known(name.clone(), old, Some(new.clone())));
                }
            }
            AttributeValue::Deferred { .. } => {
                changes.push(AttributeChange::deferred(name.clone(), old));
            }
        }
    }

    for (name, old) in recorded {
        if !desired.contains_key(name) {
            changes.push(AttributeChange::known(name.clone(), Some(old.clone()), None));
        }
    }

    changes.sort_by(|a, b| a.attribute.cmp(&b.attribute));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Declaration, ResourceId, build_graph};
    use serde_json::json;

    fn declarations() -> Vec<Declaration> {
        vec![
            Declaration::new("resource-group", "main")
                .with_attribute("name", "rg-webshop")
                .with_attribute("location", "westeurope"),
            Declaration::new("app-service-plan", "main")
                .with_attribute("resource_group", "${resource-group.main.name}")
                .with_attribute("location", "${resource-group.main.location}")
                .with_attribute("sku", "B1"),
            Declaration::new("web-app", "api")
                .with_attribute("plan_id", "${app-service-plan.main.id}")
                .with_attribute("location", "${resource-group.main.location}")
                .with_attribute("app_settings", json!({"MODE": "prod"}))
                .with_output("default_hostname"),
        ]
    }

    fn record(resource_type: &str, name: &str, attrs: Value) -> StateRecord {
        let attributes: BTreeMap<String, Value> = serde_json::from_value(attrs).unwrap();
        let hash = ConfigHasher::new().hash_resource(resource_type, &attributes);
        StateRecord::new(
            ResourceId::new(resource_type, name),
            attributes,
            format!("ext-{resource_type}-{name}"),
            BTreeMap::new(),
            hash,
        )
    }

    fn applied_snapshot() -> StateSnapshot {
        StateSnapshot::from_records([
            record(
                "resource-group",
                "main",
                json!({"name": "rg-webshop", "location": "westeurope"}),
            ),
            record(
                "app-service-plan",
                "main",
                json!({"resource_group": "rg-webshop", "location": "westeurope", "sku": "B1"}),
            ),
            record(
                "web-app",
                "api",
                json!({
                    "plan_id": "ext-app-service-plan-main",
                    "location": "westeurope",
                    "app_settings": {"MODE": "prod"}
                }),
            ),
        ])
    }

    #[test]
    fn test_fresh_plan_creates_in_order() {
        let graph = build_graph(&declarations()).unwrap();
        let plan = Planner::new()
            .plan(&graph, &StateSnapshot::new(), PlanMode::Apply)
            .unwrap();

        assert_eq!(
            plan.kinds(),
            vec![OperationKind::Create, OperationKind::Create, OperationKind::Create]
        );
        let ids: Vec<String> = plan.operations.iter().map(|op| op.id.to_string()).collect();
        assert_eq!(ids, vec!["resource-group.main", "app-service-plan.main", "web-app.api"]);
        assert_eq!(plan.operations[1].waits_on, vec![0]);
        assert_eq!(plan.operations[2].waits_on, vec![0, 1]);

        // Declared attributes of a dependency resolve at plan time
        assert_eq!(
            plan.operations[1].desired["location"],
            AttributeValue::Known(json!("westeurope"))
        );
        assert!(plan.operations[1].planned_hash.is_some());

        // The plan's id is only known once it exists
        assert!(plan.operations[2].desired["plan_id"].is_deferred());
        assert!(plan.operations[2].planned_hash.is_none());
    }

    #[test]
    fn test_unchanged_graph_is_all_noop() {
        let graph = build_graph(&declarations()).unwrap();
        let plan = Planner::new()
            .plan(&graph, &applied_snapshot(), PlanMode::Apply)
            .unwrap();

        assert!(plan.is_empty());
        assert_eq!(plan.summary().unchanged, 3);
    }

    #[test]
    fn test_setting_change_is_single_update() {
        let mut decls = declarations();
        decls[2] = decls[2]
            .clone()
            .with_attribute("app_settings", json!({"MODE": "staging"}));
        let graph = build_graph(&decls).unwrap();
        let plan = Planner::new()
            .plan(&graph, &applied_snapshot(), PlanMode::Apply)
            .unwrap();

        assert_eq!(
            plan.kinds(),
            vec![OperationKind::NoOp, OperationKind::NoOp, OperationKind::Update]
        );
        let update = &plan.operations[2];
        assert_eq!(update.changes.len(), 1);
        assert_eq!(update.changes[0].attribute, "app_settings");
        assert_eq!(update.changes[0].new, Some(json!({"MODE": "staging"})));
        assert_eq!(update.external_id.as_deref(), Some("ext-web-app-api"));
    }

    #[test]
    fn test_update_upstream_defers_downstream() {
        let mut decls = declarations();
        decls[1] = decls[1].clone().with_attribute("sku", "P1v3");
        let graph = build_graph(&decls).unwrap();
        let plan = Planner::new()
            .plan(&graph, &applied_snapshot(), PlanMode::Apply)
            .unwrap();

        assert_eq!(
            plan.kinds(),
            vec![OperationKind::NoOp, OperationKind::Update, OperationKind::Update]
        );
        let app = &plan.operations[2];
        assert_eq!(app.changes.len(), 1);
        assert!(app.changes[0].known_after_apply);
        assert_eq!(app.changes[0].old, Some(json!("ext-app-service-plan-main")));
    }

    #[test]
    fn test_removed_attribute_is_reported() {
        let mut decls = declarations();
        decls[0].attributes.remove("name");
        decls[1].attributes.remove("resource_group");
        let graph = build_graph(&decls).unwrap();
        let plan = Planner::new()
            .plan(&graph, &applied_snapshot(), PlanMode::Apply)
            .unwrap();

        let rg = &plan.operations[0];
        assert_eq!(rg.kind, OperationKind::Update);
        assert_eq!(
            rg.changes,
            vec![AttributeChange::known(
                String::from("name"),
                Some(json!("rg-webshop")),
                None
            )]
        );
    }

    #[test]
    fn test_orphaned_record_is_inconsistent() {
        let graph = build_graph(&declarations()[..1]).unwrap();
        let err = Planner::new()
            .plan(&graph, &applied_snapshot(), PlanMode::Apply)
            .unwrap_err();

        assert_eq!(
            err,
            PlanError::InconsistentState {
                orphans: vec![
                    String::from("app-service-plan.main"),
                    String::from("web-app.api")
                ]
            }
        );
    }

    #[test]
    fn test_destroy_reverses_order() {
        let graph = build_graph(&declarations()).unwrap();
        let plan = Planner::new()
            .plan(&graph, &applied_snapshot(), PlanMode::Destroy)
            .unwrap();

        let ids: Vec<String> = plan.operations.iter().map(|op| op.id.to_string()).collect();
        assert_eq!(ids, vec!["web-app.api", "app-service-plan.main", "resource-group.main"]);
        assert!(plan.operations.iter().all(|op| op.kind == OperationKind::Delete));
        assert_eq!(plan.operations[0].waits_on, Vec::<usize>::new());
        assert_eq!(plan.operations[1].waits_on, vec![0]);
        assert_eq!(plan.operations[2].waits_on, vec![0, 1]);
    }

    #[test]
    fn test_destroy_skips_unrecorded_but_keeps_order() {
        let graph = build_graph(&declarations()).unwrap();
        let mut snapshot = applied_snapshot();
        snapshot.remove(&ResourceId::new("app-service-plan", "main"));

        let plan = Planner::new()
            .plan(&graph, &snapshot, PlanMode::Destroy)
            .unwrap();

        let ids: Vec<String> = plan.operations.iter().map(|op| op.id.to_string()).collect();
        assert_eq!(ids, vec!["web-app.api", "resource-group.main"]);
        assert_eq!(plan.operations[1].waits_on, vec![0]);
    }

    #[test]
    fn test_fingerprint_recorded() {
        let graph = build_graph(&declarations()).unwrap();
        let snapshot = applied_snapshot();
        let plan = Planner::new().plan(&graph, &snapshot, PlanMode::Apply).unwrap();
        assert_eq!(plan.state_fingerprint, snapshot.fingerprint());
    }
}
