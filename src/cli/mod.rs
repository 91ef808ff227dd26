//! Command-line interface for repose-forge.
//!
//! Provides commands for schema migration, batch submission, foreground
//! and pooled processing, sweeping and batch status.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
