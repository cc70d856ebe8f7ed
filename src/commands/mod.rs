pub mod cache;
pub mod plan;
pub mod run;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use precis::config::BatchConfig;
use precis::config_discovery::load_config_with_discovery;
use precis::function::shell;
use precis::logging;
use precis::FunctionRegistry;

use crate::cli::CommonConfigArgs;

/// Function sources available to batches run from the command line
pub fn builtin_registry() -> FunctionRegistry {
    FunctionRegistry::new().with_source(shell::source())
}

/// Load the batch config, apply command-line overrides and start logging
pub fn load_config(common: &CommonConfigArgs) -> Result<BatchConfig> {
    let (mut config, path) = load_config_with_discovery(common.config.as_deref())?;

    if let Some(dir) = &common.cache_dir {
        config.cache.dir = Some(absolute(dir)?);
    }
    if common.log_level.is_some() {
        config.log_level = common.log_level.clone();
    }

    let log_file = config.log_file();
    logging::init(config.log_level.as_deref(), log_file.as_deref())
        .context("Failed to open log file")?;
    tracing::info!("[precis] Using config: {}", path.display());
    Ok(config)
}

/// Resolve a command-line path against the working directory, since config
/// paths resolve against the config file's directory instead
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(path))
}
