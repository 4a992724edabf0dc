// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # cairn
//!
//! A declarative infrastructure reconciliation engine.
//!
//! ## Overview
//!
//! cairn reads resource declarations, orders them by their references, and
//! converges the real infrastructure toward them:
//!
//! - Declarations reference each other with `${type.name.attribute}`
//! - The planner diffs declarations against recorded state by content hash
//! - The executor applies the plan in dependency order on a bounded pool,
//!   retrying transient provider failures and containing permanent ones
//! - `destroy` deletes dependents before their dependencies
//!
//! ## Architecture
//!
//! 1. **Graph**: declarations become an acyclic resource graph
//! 2. **State**: one versioned record per applied resource (local, S3, memory)
//! 3. **Planner**: graph + state snapshot produce an ordered plan
//! 4. **Executor**: runs the plan against a [`provider::Provider`]
//! 5. **Engine**: lock, plan, confirm, execute, unlock
//!
//! ## Modules
//!
//! - [`config`]: Declaration file parsing and validation
//! - [`graph`]: Resource graph construction and reference templates
//! - [`state`]: State storage backends (local, S3, memory)
//! - [`planner`]: Diff computation and plan ordering
//! - [`executor`]: Concurrent plan execution
//! - [`provider`]: Provider abstraction and the HTTP provider
//! - [`engine`]: Run orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: webshop
//!   environment: prod
//!
//! resources:
//!   - type: resource-group
//!     name: main
//!     attributes:
//!       location: westeurope
//!   - type: app-service-plan
//!     name: main
//!     attributes:
//!       location: ${resource-group.main.location}
//!       sku: B1
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, InfraConfig};
pub use engine::{Engine, RunOutcome};
pub use error::{CairnError, Result};
pub use executor::{ExecutionReport, Executor, ExecutorOptions, RunStatus};
pub use graph::{Declaration, ResourceGraph, ResourceId, build_graph};
pub use planner::{Plan, PlanMode, Planner};
pub use provider::{HttpProvider, Provider};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
