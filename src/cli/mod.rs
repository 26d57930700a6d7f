//! Command-line interface for feedback-forge.
//!
//! Provides the `score` and `estimate` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
