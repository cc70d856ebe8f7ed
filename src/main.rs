mod cli;
mod cli_utils;
mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    // Parse CLI arguments; logging starts once the config is known
    let cli = Cli::parse();

    // Dispatch to appropriate command handler
    match cli.command {
        Commands::Run(args) => commands::run::run(&args),
        Commands::Plan(args) => commands::plan::plan(&args),
        Commands::Cache(args) => commands::cache::cache(&args),
    }
}
