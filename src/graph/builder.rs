//! Validates declarations and builds the resource graph.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use super::model::{AttributeRef, Declaration, Resource, ResourceGraph};
use super::template;
use crate::error::GraphError;

/// Attribute name reported for errors in explicit `depends_on` edges.
const DEPENDS_ON: &str = "depends_on";

/// Builds a [`ResourceGraph`] from a list of declarations.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl GraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates `declarations` and returns the dependency graph.
    ///
    /// Checks run in order: identifier shape, duplicate identifiers,
    /// reference syntax, reference targets, cycles. The first failure wins.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] describing the first problem found.
    pub fn build(&self, declarations: &[Declaration]) -> Result<ResourceGraph, GraphError> {
        let mut index = HashMap::with_capacity(declarations.len());
        for (i, decl) in declarations.iter().enumerate() {
            let id = decl.id();
            id.check().map_err(|reason| GraphError::InvalidIdentifier {
                id: id.to_string(),
                reason,
            })?;
            if index.insert(id.clone(), i).is_some() {
                return Err(GraphError::DuplicateResource { id: id.to_string() });
            }
        }

        let mut resources = Vec::with_capacity(declarations.len());
        for decl in declarations {
            resources.push(Self::parse_resource(decl)?);
        }

        let mut dependencies = vec![Vec::new(); resources.len()];
        for (i, resource) in resources.iter().enumerate() {
            let mut edges = BTreeSet::new();

            for attr_ref in &resource.references {
                let reference = &attr_ref.reference;
                let target = index
                    .get(&reference.target)
                    .copied()
                    .filter(|&t| resources[t].has_attribute(&reference.attribute))
                    .ok_or_else(|| GraphError::UnresolvedReference {
                        from: resource.id.to_string(),
                        attribute: attr_ref.attribute.clone(),
                        target: reference.to_string(),
                    })?;
                edges.insert(target);
            }

            for dep in &resource.depends_on {
                let target =
                    index
                        .get(dep)
                        .copied()
                        .ok_or_else(|| GraphError::UnresolvedReference {
                            from: resource.id.to_string(),
                            attribute: String::from(DEPENDS_ON),
                            target: dep.to_string(),
                        })?;
                edges.insert(target);
            }

            dependencies[i] = edges.into_iter().collect();
        }

        let mut dependents = vec![Vec::new(); resources.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(i);
            }
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(GraphError::CyclicDependency {
                cycle: cycle.iter().map(|&i| resources[i].id.to_string()).collect(),
            });
        }

        debug!(
            resources = resources.len(),
            edges = dependencies.iter().map(Vec::len).sum::<usize>(),
            "Built resource graph"
        );

        Ok(ResourceGraph {
            resources,
            index,
            dependencies,
            dependents,
        })
    }

    fn parse_resource(decl: &Declaration) -> Result<Resource, GraphError> {
        let id = decl.id();
        let mut references = Vec::new();

        for (attribute, value) in &decl.attributes {
            let found = template::collect_references(value).map_err(|e| {
                GraphError::InvalidReference {
                    from: id.to_string(),
                    attribute: attribute.clone(),
                    expression: e.expression,
                    reason: e.reason,
                }
            })?;
            references.extend(found.into_iter().map(|reference| AttributeRef {
                attribute: attribute.clone(),
                reference,
            }));
        }

        Ok(Resource {
            id,
            attributes: decl.attributes.clone(),
            references,
            depends_on: decl.depends_on.clone(),
            outputs: decl.outputs.iter().cloned().collect(),
        })
    }
}

/// Depth-first search for a cycle; returns its members in path order.
fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    let mut path = Vec::new();

    for start in 0..dependencies.len() {
        if marks[start] == Mark::Unvisited {
            if let Some(cycle) = visit(start, dependencies, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit(
    node: usize,
    dependencies: &[Vec<usize>],
    marks: &mut [Mark],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks[node] = Mark::InProgress;
    path.push(node);

    for &next in &dependencies[node] {
        match marks[next] {
            Mark::InProgress => {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                return Some(path[start..].to_vec());
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, dependencies, marks, path) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    path.pop();
    marks[node] = Mark::Done;
    None
}

/// Convenience wrapper for [`GraphBuilder::build`].
///
/// # Errors
///
/// See [`GraphBuilder::build`].
pub fn build_graph(declarations: &[Declaration]) -> Result<ResourceGraph, GraphError> {
    GraphBuilder::new().build(declarations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::ResourceId;

    fn rg() -> Declaration {
        Declaration::new("resource-group", "main").with_attribute("location", "westeurope")
    }

    fn plan() -> Declaration {
        Declaration::new("app-service-plan", "main")
            .with_attribute("resource_group", "${resource-group.main.name}")
            .with_attribute("sku", "B1")
    }

    fn app() -> Declaration {
        Declaration::new("web-app", "api")
            .with_attribute("plan_id", "${app-service-plan.main.id}")
            .with_output("default_hostname")
    }

    #[test]
    fn test_build_linear_chain() {
        let rg = rg().with_attribute("name", "rg-prod");
        let graph = build_graph(&[rg, plan(), app()]).unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependencies(0), &[] as &[usize]);
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependencies(2), &[1]);
        assert_eq!(graph.dependents(0), &[1]);
        assert_eq!(graph.topological_order().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let rg = rg().with_attribute("name", "rg-prod");
        let graph = build_graph(&[app(), plan(), rg]).unwrap();
        let order: Vec<String> = graph
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|i| graph.resources()[i].id.to_string())
            .collect();
        assert_eq!(
            order,
            vec!["resource-group.main", "app-service-plan.main", "web-app.api"]
        );
    }

    #[test]
    fn test_duplicate_resource() {
        let err = build_graph(&[rg(), rg()]).unwrap_err();
        assert_eq!(
            err,
            GraphError::DuplicateResource {
                id: String::from("resource-group.main")
            }
        );
    }

    #[test]
    fn test_identifier_parts_must_round_trip() {
        let err = build_graph(&[Declaration::new("svc", "api.v2")]).unwrap_err();
        assert_eq!(
            err,
            GraphError::InvalidIdentifier {
                id: String::from("svc.api.v2"),
                reason: String::from("name 'api.v2' contains '.'"),
            }
        );

        let err = build_graph(&[rg(), Declaration::new("", "main")]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidIdentifier { reason, .. } if reason == "type is empty"));

        let err = build_graph(&[Declaration::new("web.app", "api")]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidIdentifier { .. }));

        // Every identifier the builder accepts parses back from its string form
        let graph = build_graph(&[rg(), plan(), app()]).unwrap();
        for resource in graph.resources() {
            assert_eq!(ResourceId::parse(&resource.id.to_string()).unwrap(), resource.id);
        }
    }

    #[test]
    fn test_unresolved_target() {
        let err = build_graph(&[app()]).unwrap_err();
        assert!(matches!(err, GraphError::UnresolvedReference { ref target, .. }
            if target == "app-service-plan.main.id"));
    }

    #[test]
    fn test_unresolved_attribute() {
        // `name` is neither declared nor an output of the resource group
        let err = build_graph(&[rg(), plan()]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnresolvedReference {
                from: String::from("app-service-plan.main"),
                attribute: String::from("resource_group"),
                target: String::from("resource-group.main.name"),
            }
        );
    }

    #[test]
    fn test_unresolved_depends_on() {
        let decl = rg().with_depends_on(ResourceId::new("key-vault", "missing"));
        let err = build_graph(&[decl]).unwrap_err();
        assert!(matches!(err, GraphError::UnresolvedReference { ref attribute, .. }
            if attribute == "depends_on"));
    }

    #[test]
    fn test_invalid_reference_syntax() {
        let decl = rg().with_attribute("tags", "${resource-group}");
        let err = build_graph(&[decl]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidReference { .. }));
    }

    #[test]
    fn test_cycle_detected() {
        let a = Declaration::new("svc", "a").with_attribute("peer", "${svc.b.id}");
        let b = Declaration::new("svc", "b").with_attribute("peer", "${svc.a.id}");
        let err = build_graph(&[a, b]).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: vec![String::from("svc.a"), String::from("svc.b")]
            }
        );
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let a = Declaration::new("svc", "a")
            .with_attribute("name", "a")
            .with_attribute("alias", "${svc.a.name}");
        let err = build_graph(&[a]).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: vec![String::from("svc.a")]
            }
        );
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let rg = rg().with_attribute("name", "rg-prod");
        let sa = Declaration::new("storage-account", "logs")
            .with_attribute("resource_group", "${resource-group.main.name}")
            .with_attribute("location", "${resource-group.main.location}")
            .with_depends_on(ResourceId::new("resource-group", "main"));
        let graph = build_graph(&[rg, sa]).unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.resources()[1].references.len(), 2);
    }
}
