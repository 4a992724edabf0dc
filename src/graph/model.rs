//! Resource graph model types.
//!
//! Resources live in an arena indexed by declaration order; edges are index
//! lists, so traversal never needs shared mutable links between nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Name of the implicit attribute carrying the provider-assigned identifier.
pub const EXTERNAL_ID_ATTRIBUTE: &str = "id";

/// Stable identifier of a resource: type tag plus symbolic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Type tag, e.g. `resource-group`.
    pub resource_type: String,
    /// Symbolic name, unique per type.
    pub name: String,
}

/// A dependency of one attribute on another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Referenced resource.
    pub target: ResourceId,
    /// Referenced attribute of the target.
    pub attribute: String,
}

/// A reference found inside one of a resource's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRef {
    /// Attribute whose value contains the reference.
    pub attribute: String,
    /// The reference itself.
    pub reference: Reference,
}

/// A resource as declared by the configuration loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    /// Type tag.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Symbolic name.
    pub name: String,
    /// Desired attributes; strings may embed `${type.name.attribute}`.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit ordering edges with no attribute reference.
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
    /// Attributes the provider computes (endpoints, generated names, ...).
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A validated node of the resource graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Identifier.
    pub id: ResourceId,
    /// Desired attributes exactly as declared.
    pub attributes: BTreeMap<String, Value>,
    /// References discovered in attribute values, in attribute order.
    pub references: Vec<AttributeRef>,
    /// Explicit ordering edges.
    pub depends_on: Vec<ResourceId>,
    /// Provider-computed attribute names.
    pub outputs: BTreeSet<String>,
}

/// The validated desired-state graph.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    pub(crate) resources: Vec<Resource>,
    pub(crate) index: HashMap<ResourceId, usize>,
    pub(crate) dependencies: Vec<Vec<usize>>,
    pub(crate) dependents: Vec<Vec<usize>>,
}

impl ResourceId {
    /// Creates a new identifier.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Parses an identifier from `type.name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not two non-empty dot-separated parts.
    pub fn parse(s: &str) -> Result<Self, String> {
        s.split_once('.')
            .map(|(resource_type, name)| Self::new(resource_type, name))
            .filter(|id| id.check().is_ok())
            .ok_or_else(|| format!("Invalid resource identifier: {s}. Expected format: TYPE.NAME"))
    }

    /// Checks that both parts are non-empty and free of dots, so the
    /// identifier survives a round trip through its `type.name` form.
    ///
    /// # Errors
    ///
    /// Returns the reason the identifier is rejected.
    pub fn check(&self) -> Result<(), String> {
        for (part, value) in [("type", &self.resource_type), ("name", &self.name)] {
            if value.is_empty() {
                return Err(format!("{part} is empty"));
            }
            if value.contains('.') {
                return Err(format!("{part} '{value}' contains '.'"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

impl Reference {
    /// Creates a new reference.
    #[must_use]
    pub fn new(target: ResourceId, attribute: impl Into<String>) -> Self {
        Self {
            target,
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

impl Declaration {
    /// Creates a declaration with no attributes.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit ordering edge.
    #[must_use]
    pub fn with_depends_on(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }

    /// Declares a provider-computed attribute.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Returns the identifier of this declaration.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }
}

impl Resource {
    /// Returns true if `attribute` can be referenced on this resource.
    #[must_use]
    pub fn has_attribute(&self, attribute: &str) -> bool {
        attribute == EXTERNAL_ID_ATTRIBUTE
            || self.attributes.contains_key(attribute)
            || self.outputs.contains(attribute)
    }

    /// Returns true if `attribute` is declared (as opposed to provider-computed).
    #[must_use]
    pub fn is_declared(&self, attribute: &str) -> bool {
        self.attributes.contains_key(attribute)
    }
}

impl ResourceGraph {
    /// Returns the number of resources.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph holds no resources.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns all resources in declaration order.
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Returns the resource at `index`.
    #[must_use]
    pub fn resource(&self, index: usize) -> Option<&Resource> {
        self.resources.get(index)
    }

    /// Returns the arena index of a resource.
    #[must_use]
    pub fn index_of(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Looks up a resource by identifier.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index_of(id).and_then(|i| self.resources.get(i))
    }

    /// Returns true if the graph declares `id`.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Direct dependencies of the resource at `index`.
    #[must_use]
    pub fn dependencies(&self, index: usize) -> &[usize] {
        self.dependencies.get(index).map_or(&[], Vec::as_slice)
    }

    /// Direct dependents of the resource at `index`.
    #[must_use]
    pub fn dependents(&self, index: usize) -> &[usize] {
        self.dependents.get(index).map_or(&[], Vec::as_slice)
    }

    /// Orders resources so that every dependency precedes its dependents.
    ///
    /// Kahn's algorithm; among resources with no ordering constraint between
    /// them, the one declared first comes first.
    ///
    /// # Errors
    ///
    /// Returns the indices left unordered if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<usize>, Vec<usize>> {
        let mut indegree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.resources.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in self.dependents(next) {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() == self.resources.len() {
            Ok(order)
        } else {
            Err(indegree
                .iter()
                .enumerate()
                .filter(|(_, count)| **count > 0)
                .map(|(i, _)| i)
                .collect())
        }
    }
}
