/// `precis plan` command implementation
///
/// Dry run: prints every step's key and whether the local cache has it.
use anyhow::{Context, Result};

use precis::Batch;

use super::{builtin_registry, load_config};
use crate::cli::PlanArgs;
use crate::cli_utils::precis_prefix;

pub fn plan(args: &PlanArgs) -> Result<()> {
    let config = load_config(&args.common)?;
    let batch = Batch::new(config, builtin_registry()).context("Invalid batch configuration")?;
    let steps = batch.plan().context("Failed to plan batch")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    for step in &steps {
        let status = if step.cached { "CACHED ✓" } else { "NOT CACHED ✗" };
        println!("{} {} ({})", precis_prefix(), step.id, step.function);
        println!("    Key: {}", step.key);
        println!("    Status: {}", status);
        if !step.depends.is_empty() {
            println!("    Depends on: {}", step.depends.join(", "));
        }
    }

    let cached = steps.iter().filter(|s| s.cached).count();
    println!(
        "{} {} of {} steps cached",
        precis_prefix(),
        cached,
        steps.len()
    );
    Ok(())
}
