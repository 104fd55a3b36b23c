//! rag-orchestrator CLI entry point.
//!
//! Logs go to stderr; stdout carries the JSON printed by `submit`, `status`,
//! `jobs` and `health`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = rag_orchestrator::cli::parse_cli();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    rag_orchestrator::cli::run_with_cli(cli).await
}
