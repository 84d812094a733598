//! reportloom CLI: allocate a document corpus onto a report outline.
//!
//! Summarizes documents, matches them to outline sections, fills gaps with
//! supplementary collection, and proposes charts backed by numeric sources.

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
