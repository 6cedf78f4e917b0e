//! Enricher CLI: one bounded enrichment run per invocation, plus the
//! operator commands around it (selection, queue, budgets, mapping).
//!
//! Schedule `enricher run` from cron (or any periodic host); each run stops
//! on its own before its time budget is spent.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
