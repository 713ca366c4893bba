//! Command-line interface for agent-runner.
//!
//! Provides the `run` command for executing one task and the `reap` command
//! for cleaning up containers left behind by a crashed runner.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, BackendKind, Cli, Commands, ReapArgs, RunArgs};
