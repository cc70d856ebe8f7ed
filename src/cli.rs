use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// precis - cached analytics steps rendered into documents
///
/// precis runs the steps declared in precis.toml, caching every result by
/// content, then renders the templates through the filter chain into the
/// publish directory.
#[derive(Parser, Debug)]
#[command(name = "precis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Content-addressed analytics batches and document pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Common configuration arguments shared across commands
#[derive(Parser, Debug, Clone)]
pub struct CommonConfigArgs {
    /// Config file path (discovered from the working directory when omitted)
    #[arg(short = 'c', long, env = "PRECIS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local cache directory
    #[arg(long, env = "PRECIS_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Log level (trace|debug|info|warn|error)
    #[arg(long, env = "PRECIS_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the batch and publish its documents
    Run(RunArgs),

    /// Show every step's cache key and whether it is cached, without running
    Plan(PlanArgs),

    /// Inspect the local cache
    Cache(CacheArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonConfigArgs,

    /// Publish directory (emptied before the batch runs)
    #[arg(long, env = "PRECIS_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Worker threads for independent steps (0 = one per CPU)
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Print the batch report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub common: CommonConfigArgs,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,

    #[command(flatten)]
    pub common: CommonConfigArgs,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show cache statistics
    Stats,

    /// Print the metadata stored for a step key
    Show {
        /// Step cache key (64 hex characters)
        key: String,
    },
}
