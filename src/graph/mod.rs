//! Desired-state resource graph.
//!
//! This module provides:
//! - Resource identifiers, declarations, and the arena-backed graph
//! - Reference expression parsing and substitution
//! - Graph validation (duplicates, unresolved references, cycles)

mod builder;
mod model;
pub mod template;

pub use builder::{GraphBuilder, build_graph};
pub use model::{
    AttributeRef, Declaration, EXTERNAL_ID_ATTRIBUTE, Reference, Resource, ResourceGraph,
    ResourceId,
};
pub use template::AttributeValue;
