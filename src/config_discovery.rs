use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::BatchConfig;

pub const CONFIG_FILE_NAME: &str = "precis.toml";

/// Discovers batch configuration by traversing up the directory tree
pub fn discover_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE_NAME);
        if config_path.is_file() {
            return Some(config_path);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    // Fallback to global config
    let global_config = dirs::home_dir()?.join(".config/precis/config.toml");
    global_config.is_file().then_some(global_config)
}

/// Loads configuration with auto-discovery support
///
/// If `explicit_path` is provided, loads config from that path.
/// Otherwise, auto-discovers config by traversing up directory tree from cwd.
pub fn load_config_with_discovery(explicit_path: Option<&Path>) -> Result<(BatchConfig, PathBuf)> {
    let path = match explicit_path {
        Some(path) => path.to_path_buf(),
        None => {
            let current_dir = std::env::current_dir()
                .context("Failed to get current directory for config discovery")?;
            discover_config(&current_dir).with_context(|| {
                format!(
                    "No {} found in {} or any parent directory",
                    CONFIG_FILE_NAME,
                    current_dir.display()
                )
            })?
        }
    };

    let config = BatchConfig::from_file(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    Ok((config, path))
}
