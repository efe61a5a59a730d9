//! Command-line interface for agent-dispatcher.
//!
//! Provides the `serve` command plus agent, queue and task operator
//! administration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
