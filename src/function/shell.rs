//! Built-in `shell` function source
//!
//! `shell.run` runs an external command in a private scratch directory:
//!
//! ```toml
//! [[steps]]
//! id = "plot"
//! function = "shell.run"
//! args = { command = ["gnuplot", "plot.gp"], outputs = ["plot.png"], timeout = 60 }
//! ```
//!
//! The output value is the command's trimmed stdout. Every name in `outputs`
//! must exist in the scratch directory afterwards and is registered as a
//! supplemental file.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::time::Duration;

use super::{ExecutionContext, FunctionSource, StepFunction};
use crate::process::run_command;

pub const SOURCE_NAME: &str = "shell";

/// Bump when `run` changes behaviour
const RUN_FINGERPRINT: &str = "shell.run/1";

pub fn source() -> FunctionSource {
    FunctionSource::new(SOURCE_NAME).with(StepFunction::new("run", RUN_FINGERPRINT, run))
}

fn run(ctx: &mut ExecutionContext<'_>, args: &Map<String, Value>) -> Result<Value> {
    let command = string_list(args, "command")?;
    let (program, program_args) = command
        .split_first()
        .context("shell.run: command must not be empty")?;
    let outputs = match args.get("outputs") {
        Some(_) => string_list(args, "outputs")?,
        None => Vec::new(),
    };
    let timeout = args
        .get("timeout")
        .map(|t| t.as_u64().context("shell.run: timeout must be whole seconds"))
        .transpose()?
        .map(Duration::from_secs);

    let scratch = ctx.scratch_dir()?;
    let output = run_command(program, program_args, scratch.path(), timeout, ctx.cancel())?
        .ensure_success(program)?;

    for name in &outputs {
        let produced = scratch.path().join(name);
        if !produced.is_file() {
            anyhow::bail!("{} did not produce declared output '{}'", program, name);
        }
        ctx.add_existing_file(&produced, name)?;
    }

    Ok(Value::String(
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    ))
}

fn string_list(args: &Map<String, Value>, name: &str) -> Result<Vec<String>> {
    let value = args
        .get(name)
        .with_context(|| format!("shell.run: missing argument '{name}'"))?;
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .with_context(|| format!("shell.run: '{name}' entries must be strings"))
            })
            .collect(),
        other => anyhow::bail!("shell.run: '{}' must be a list of strings, got {}", name, other),
    }
}
