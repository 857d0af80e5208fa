//! curator CLI — rule-based URL curation and pipeline orchestration.
//!
//! Classifies URLs against the rule catalogue, discovers new patterns from
//! labeled history, and drives the resumable curation pipeline.

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
