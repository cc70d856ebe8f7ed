/// `precis run` command implementation
///
/// Runs the batch with the built-in function sources and publishes its documents.
use anyhow::{Context, Result};

use precis::{Batch, BatchReport, CancelFlag};

use super::{absolute, builtin_registry, load_config};
use crate::cli::RunArgs;
use crate::cli_utils::precis_prefix;

pub fn run(args: &RunArgs) -> Result<()> {
    let mut config = load_config(&args.common)?;

    if let Some(dir) = &args.output_dir {
        config.output.dir = Some(absolute(dir)?);
    }
    if let Some(jobs) = args.jobs {
        config.jobs = if jobs == 0 { num_cpus::get() } else { jobs };
    }

    let mut batch = Batch::new(config, builtin_registry()).context("Invalid batch configuration")?;
    cancel_on_ctrl_c(batch.cancel_handle());

    let report = batch.run().context("Batch failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    for step in &report.steps {
        println!(
            "{} {:<24} {:<9} {:>8.2}s  {}",
            precis_prefix(),
            step.id,
            step.outcome.as_str(),
            step.elapsed_seconds,
            &step.key.as_str()[..12]
        );
    }
    println!(
        "{} {} executed, {} cached, {} documents",
        precis_prefix(),
        report.executed(),
        report.cached(),
        report.documents.len()
    );
    println!("{} Published to {}", precis_prefix(), report.output_dir.display());
}

/// Cancel the batch on Ctrl-C. Running steps see the flag and in-flight
/// external processes are killed.
fn cancel_on_ctrl_c(cancel: CancelFlag) {
    std::thread::spawn(move || {
        let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        else {
            return;
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("[precis] Interrupted, cancelling batch");
                cancel.cancel();
            }
        });
    });
}
