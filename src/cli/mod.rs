//! Command-line interface for rag-orchestrator.
//!
//! Provides commands for running workers, submitting jobs and inspecting
//! job and system state.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Backend, Cli, Commands};
