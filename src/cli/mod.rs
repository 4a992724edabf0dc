//! CLI module for the cairn tool.
//!
//! Command definitions and output formatting. The commands themselves are
//! wired up in the binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
