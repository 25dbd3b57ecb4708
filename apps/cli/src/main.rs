//! Biosecurity threat forecaster CLI.
//!
//! Ingests publications, extracts AI capabilities, and scores them against
//! a curated biosecurity threat catalog.

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
