//! Template rendering
//!
//! The pipeline treats rendering as opaque behind [`TemplateEngine`]. The
//! built-in [`ExpressionEngine`] substitutes `{{ expression }}` blocks where an
//! expression is a variable path or a helper call:
//!
//! ```text
//! {{ data['add_numbers']['function_output'] }}
//! {{ data.summary.function_output.rows[0] }}
//! {{ read_file_contents('table.html') }}
//! {{ load_json('stats.json')['mean'] }}
//! {{ fn_params('add_numbers', 'a') }}
//! {{ now('%Y-%m-%d') }}
//! ```

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache_key::{template_file_key, template_text_key, CacheKey};
use crate::error::Result as PrecisResult;
use crate::function::MetadataEnvelope;

/// Canonical name of an inline template
pub const INLINE_TEMPLATE_NAME: &str = "template.md";

/// Renders template text against batch data
pub trait TemplateEngine: Send + Sync {
    fn render(&self, source: &str, data: &TemplateData) -> Result<String>;
}

/// A template and its content key
#[derive(Debug, Clone)]
pub struct TemplateSource {
    pub canonical_name: String,
    pub key: CacheKey,
    pub text: String,
}

impl TemplateSource {
    pub fn inline(text: &str) -> Self {
        Self {
            canonical_name: INLINE_TEMPLATE_NAME.to_string(),
            key: template_text_key(text),
            text: text.to_string(),
        }
    }

    /// Load a template file; its canonical name is the file name
    pub fn from_file(path: &Path) -> PrecisResult<Self> {
        let text = fs::read_to_string(path).map_err(crate::error::PrecisError::io(path))?;
        let canonical_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| INLINE_TEMPLATE_NAME.to_string());
        Ok(Self {
            canonical_name,
            key: template_file_key(path)?,
            text,
        })
    }
}

/// Data available to templates
///
/// `data` maps step id to `{function_output, function_elapsed_seconds,
/// supplemental_files, key}`, `keys` lists step ids in declaration order and
/// `params` maps step id to its arguments.
#[derive(Debug, Clone, Default)]
pub struct TemplateData {
    data: Map<String, Value>,
    keys: Vec<String>,
    params: Map<String, Value>,
    files: BTreeMap<String, PathBuf>,
}

impl TemplateData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a completed step. `file_paths` maps each supplemental file's
    /// canonical name to its cached copy.
    pub fn insert_step(
        &mut self,
        step_id: &str,
        args: &Map<String, Value>,
        envelope: &MetadataEnvelope,
        file_paths: impl IntoIterator<Item = (String, PathBuf)>,
    ) {
        let files: Map<String, Value> = envelope
            .supplemental_files
            .values()
            .map(|f| {
                (
                    f.canonical_name.clone(),
                    json!({
                        "canonical_name": f.canonical_name,
                        "key": f.key,
                        "public_urls": f.public_urls,
                    }),
                )
            })
            .collect();

        self.data.insert(
            step_id.to_string(),
            json!({
                "function_output": envelope.function_output,
                "function_elapsed_seconds": envelope.function_elapsed_seconds,
                "supplemental_files": files,
                "key": envelope.key,
            }),
        );
        if !self.keys.iter().any(|k| k == step_id) {
            self.keys.push(step_id.to_string());
        }
        self.params
            .insert(step_id.to_string(), Value::Object(args.clone()));
        self.files.extend(file_paths);
    }

    /// Root namespace for variable lookups
    pub fn to_value(&self) -> Value {
        json!({
            "data": self.data,
            "keys": self.keys,
            "params": self.params,
        })
    }

    pub fn step_ids(&self) -> &[String] {
        &self.keys
    }

    /// Canonical name and cached path of every supplemental file
    pub fn files(&self) -> impl Iterator<Item = (&String, &PathBuf)> {
        self.files.iter()
    }

    pub fn read_file_contents(&self, canonical_name: &str) -> Result<String> {
        let path = self
            .files
            .get(canonical_name)
            .with_context(|| format!("no step registered a file named '{canonical_name}'"))?;
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    }

    pub fn load_json(&self, canonical_name: &str) -> Result<Value> {
        let text = self.read_file_contents(canonical_name)?;
        serde_json::from_str(&text).with_context(|| format!("{canonical_name} is not valid JSON"))
    }

    pub fn fn_params(&self, step_id: &str, param: &str) -> Result<Value> {
        self.params
            .get(step_id)
            .and_then(|p| p.get(param))
            .cloned()
            .with_context(|| format!("step '{step_id}' has no parameter '{param}'"))
    }
}

/// Built-in `{{ expression }}` engine
///
/// Undefined variables and keys are errors rather than empty strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEngine;

impl TemplateEngine for ExpressionEngine {
    fn render(&self, source: &str, data: &TemplateData) -> Result<String> {
        let root = data.to_value();
        let mut out = String::with_capacity(source.len());
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let offset = source.len() - rest.len() + start;
            let end = after
                .find("}}")
                .with_context(|| format!("unclosed '{{{{' at offset {offset}"))?;
            let expression = after[..end].trim();
            let value = Evaluator::new(expression, &root, data)
                .evaluate()
                .with_context(|| format!("in expression '{expression}'"))?;
            out.push_str(&display(&value));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

struct Evaluator<'a> {
    src: &'a str,
    pos: usize,
    root: &'a Value,
    data: &'a TemplateData,
}

impl<'a> Evaluator<'a> {
    fn new(src: &'a str, root: &'a Value, data: &'a TemplateData) -> Self {
        Self {
            src,
            pos: 0,
            root,
            data,
        }
    }

    fn evaluate(mut self) -> Result<Value> {
        let name = self.identifier()?;
        self.skip_ws();
        let mut value = if self.eat('(') {
            let args = self.call_args()?;
            self.call(&name, &args)?
        } else {
            self.root
                .get(&name)
                .cloned()
                .with_context(|| format!("undefined variable '{name}'"))?
        };

        loop {
            self.skip_ws();
            if self.eat('[') {
                self.skip_ws();
                value = match self.peek() {
                    Some('\'') | Some('"') => {
                        let key = self.string()?;
                        lookup_key(value, &key)?
                    }
                    _ => {
                        let index = self.integer()?;
                        lookup_index(value, index)?
                    }
                };
                self.skip_ws();
                self.expect(']')?;
            } else if self.eat('.') {
                let key = self.identifier()?;
                value = lookup_key(value, &key)?;
            } else {
                break;
            }
        }

        self.skip_ws();
        if self.pos < self.src.len() {
            anyhow::bail!("unexpected '{}'", &self.src[self.pos..]);
        }
        Ok(value)
    }

    fn call(&self, name: &str, args: &[String]) -> Result<Value> {
        match (name, args) {
            ("read_file_contents", [file]) => {
                Ok(Value::String(self.data.read_file_contents(file)?))
            }
            ("load_json", [file]) => self.data.load_json(file),
            ("fn_params", [step, param]) => self.data.fn_params(step, param),
            ("now", []) => Ok(Value::String(chrono::Local::now().to_rfc3339())),
            ("now", [format]) => {
                let mut stamp = String::new();
                write!(stamp, "{}", chrono::Local::now().format(format))
                    .map_err(|_| anyhow::anyhow!("invalid date format '{format}'"))?;
                Ok(Value::String(stamp))
            }
            ("read_file_contents" | "load_json" | "fn_params" | "now", _) => {
                anyhow::bail!("wrong number of arguments to {name}()")
            }
            _ => anyhow::bail!("unknown function '{name}'"),
        }
    }

    fn call_args(&mut self) -> Result<Vec<String>> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.eat(')') {
            return Ok(args);
        }
        loop {
            self.skip_ws();
            args.push(self.string()?);
            self.skip_ws();
            if self.eat(')') {
                return Ok(args);
            }
            self.expect(',')?;
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if !self.eat(c) {
            anyhow::bail!("expected '{}' at offset {}", c, self.pos);
        }
        Ok(())
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn identifier(&mut self) -> Result<String> {
        self.skip_ws();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            anyhow::bail!("expected a name at offset {}", start);
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn string(&mut self) -> Result<String> {
        let quote = match self.peek() {
            Some(q @ ('\'' | '"')) => q,
            _ => anyhow::bail!("expected a quoted string at offset {}", self.pos),
        };
        self.pos += 1;
        let start = self.pos;
        let len = self.src[start..]
            .find(quote)
            .context("unterminated string")?;
        self.pos = start + len + 1;
        Ok(self.src[start..start + len].to_string())
    }

    fn integer(&mut self) -> Result<usize> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        self.src[start..self.pos]
            .parse()
            .with_context(|| format!("expected an index at offset {start}"))
    }
}

fn lookup_key(value: Value, key: &str) -> Result<Value> {
    match value {
        Value::Object(mut map) => map
            .remove(key)
            .with_context(|| format!("no key '{key}'")),
        other => anyhow::bail!("cannot look up '{}' in {}", key, type_name(&other)),
    }
}

fn lookup_index(value: Value, index: usize) -> Result<Value> {
    match value {
        Value::Array(mut items) if index < items.len() => Ok(items.swap_remove(index)),
        Value::Array(items) => {
            anyhow::bail!("index {} out of range for {} items", index, items.len())
        }
        other => anyhow::bail!("cannot index {}", type_name(&other)),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
