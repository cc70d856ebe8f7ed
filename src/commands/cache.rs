/// `precis cache` command implementation
///
/// Inspects the local cache (stats, show).
use anyhow::{Context, Result};

use precis::config_discovery::load_config_with_discovery;
use precis::function::MetadataEnvelope;
use precis::storage::{default_cache_dir, METADATA_EXT};
use precis::{logging, CacheKey, CacheStore};

use super::absolute;
use crate::cli::{CacheArgs, CacheCommands};
use crate::cli_utils::format_bytes;

pub fn cache(args: &CacheArgs) -> Result<()> {
    logging::init(args.common.log_level.as_deref(), None)?;

    // --cache-dir, then the config's cache dir, then the default
    let cache_dir = match &args.common.cache_dir {
        Some(dir) => absolute(dir)?,
        None => match load_config_with_discovery(args.common.config.as_deref()) {
            Ok((config, _)) => config.cache_dir(),
            Err(_) if args.common.config.is_none() => default_cache_dir(),
            Err(e) => return Err(e),
        },
    };
    let store = CacheStore::new(&cache_dir).context("Failed to open cache")?;

    match &args.command {
        CacheCommands::Stats => stats(&store),
        CacheCommands::Show { key } => show(&store, key),
    }
}

/// Show cache statistics
fn stats(store: &CacheStore) -> Result<()> {
    let stats = store.stats().context("Failed to get cache statistics")?;

    println!("Cache Statistics");
    println!();
    println!("Directory: {}", stats.cache_dir.display());
    println!("Objects: {}", stats.total_objects);
    println!("Step results: {}", stats.metadata_entries);
    println!("Total size: {}", format_bytes(stats.total_bytes));

    Ok(())
}

/// Print a step's stored metadata
fn show(store: &CacheStore, key: &str) -> Result<()> {
    let key = CacheKey::parse(key).context("Invalid cache key")?;
    if !store.exists(&key, METADATA_EXT) {
        println!("Status: NOT CACHED ✗");
        return Ok(());
    }

    let envelope: MetadataEnvelope = store
        .read_json(&key, METADATA_EXT)
        .context("Failed to read step metadata")?;

    println!("Status: CACHED ✓");
    println!();
    println!("Function: {}", envelope.function);
    println!("Created: {}", envelope.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Duration: {:.2}s", envelope.function_elapsed_seconds);
    println!(
        "Output: {}",
        serde_json::to_string_pretty(&envelope.function_output)?
    );
    if !envelope.supplemental_files.is_empty() {
        println!("Files:");
        for file in envelope.supplemental_files.values() {
            let present = if store.exists(&file.key, &file.ext) { "✓" } else { "✗" };
            println!("  {} {} ({})", present, file.canonical_name, file.object_name());
        }
    }

    Ok(())
}
