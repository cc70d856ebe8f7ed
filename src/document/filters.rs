use anyhow::{Context, Result};
use pulldown_cmark::{html, Options, Parser};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cancel::CancelFlag;
use crate::logging::{operations, services};
use crate::process::run_command;

/// What a filter gets besides its input and output paths
pub struct FilterContext<'a> {
    /// Scratch directory holding the input and every supplemental file
    pub work_dir: &'a Path,
    /// Canonical name of the document being transformed
    pub document: &'a str,
    pub cancel: &'a CancelFlag,
}

/// One document transformation
///
/// A filter reads `input` and must create `output` or fail. Both paths live
/// inside `ctx.work_dir`.
pub trait Filter: Send + Sync {
    fn apply(
        &self,
        ctx: &FilterContext<'_>,
        input: &Path,
        output: &Path,
        output_ext: &str,
        options: &Map<String, Value>,
    ) -> Result<()>;
}

/// Filters by id
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<String, Arc<dyn Filter>>,
}

impl FilterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `uppercase`, `markdown`, `copy` and `command`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("uppercase", UppercaseFilter);
        registry.register("markdown", MarkdownFilter);
        registry.register("copy", CopyFilter);
        registry.register("command", CommandFilter);
        registry
    }

    pub fn register<F: Filter + 'static>(&mut self, id: &str, filter: F) {
        self.filters.insert(id.to_string(), Arc::new(filter));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.filters.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.filters.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Uppercases text
pub struct UppercaseFilter;

impl Filter for UppercaseFilter {
    fn apply(
        &self,
        _ctx: &FilterContext<'_>,
        input: &Path,
        output: &Path,
        _output_ext: &str,
        _options: &Map<String, Value>,
    ) -> Result<()> {
        let text = fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
        fs::write(output, text.to_uppercase())
            .with_context(|| format!("Failed to write {}", output.display()))?;
        Ok(())
    }
}

/// Markdown to HTML
///
/// Options: `standalone` (bool) wraps the fragment in a full HTML document,
/// `title` sets its title.
pub struct MarkdownFilter;

impl Filter for MarkdownFilter {
    fn apply(
        &self,
        _ctx: &FilterContext<'_>,
        input: &Path,
        output: &Path,
        _output_ext: &str,
        options: &Map<String, Value>,
    ) -> Result<()> {
        let markdown = fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;

        let mut body = String::new();
        html::push_html(&mut body, Parser::new_ext(&markdown, markdown_options()));

        let standalone = options
            .get("standalone")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let document = if standalone {
            let title = options.get("title").and_then(Value::as_str).unwrap_or("");
            format!(
                "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
                 <title>{}</title>\n</head>\n<body>\n{}</body>\n</html>\n",
                escape_html(title),
                body
            )
        } else {
            body
        };

        fs::write(output, document)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        Ok(())
    }
}

/// Copies the input unchanged (useful for renaming the extension)
pub struct CopyFilter;

impl Filter for CopyFilter {
    fn apply(
        &self,
        _ctx: &FilterContext<'_>,
        input: &Path,
        output: &Path,
        _output_ext: &str,
        _options: &Map<String, Value>,
    ) -> Result<()> {
        fs::copy(input, output).with_context(|| {
            format!("Failed to copy {} to {}", input.display(), output.display())
        })?;
        Ok(())
    }
}

/// Runs an external converter (pandoc, weasyprint, ...)
///
/// Options:
/// - `program` (required)
/// - `args`: list; `{input}`, `{output}` and `{ext}` are substituted, with
///   paths relative to the working directory
/// - `timeout`: seconds
pub struct CommandFilter;

impl Filter for CommandFilter {
    fn apply(
        &self,
        ctx: &FilterContext<'_>,
        input: &Path,
        output: &Path,
        output_ext: &str,
        options: &Map<String, Value>,
    ) -> Result<()> {
        let program = options
            .get("program")
            .and_then(Value::as_str)
            .context("command filter requires a 'program' option")?;

        let input_arg = relative_to(input, ctx.work_dir);
        let output_arg = relative_to(output, ctx.work_dir);
        let args = match options.get("args") {
            None => vec![input_arg.clone(), "-o".to_string(), output_arg.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(|s| {
                            s.replace("{input}", &input_arg)
                                .replace("{output}", &output_arg)
                                .replace("{ext}", output_ext)
                        })
                        .context("command filter args must be strings")
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => anyhow::bail!("command filter args must be a list, got {}", other),
        };
        let timeout = options
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_secs);

        debug!(
            service = services::PIPELINE,
            operation = operations::FILTER,
            document = ctx.document,
            program = program,
            "running converter"
        );
        run_command(program, &args, ctx.work_dir, timeout, ctx.cancel)?.ensure_success(program)?;

        if !output.is_file() {
            anyhow::bail!("{} exited successfully but did not create {}", program, output_arg);
        }
        Ok(())
    }
}

fn markdown_options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
}

fn relative_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
