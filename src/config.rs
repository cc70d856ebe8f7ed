use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PrecisError, Result};
use crate::storage::{default_cache_dir, default_output_dir};

/// Reserved argument naming upstream steps
pub const DEPENDS_ARG: &str = "depends";

/// Complete batch configuration (loaded from `precis.toml`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Default log level when RUST_LOG is unset
    #[serde(default)]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Worker threads for independent steps (1 = sequential)
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub template: TemplateConfig,

    #[serde(default)]
    pub steps: Vec<StepConfig>,

    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,

    /// Directory relative paths resolve against (the config file's directory)
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            log_file: None,
            jobs: default_jobs(),
            cache: CacheConfig::default(),
            output: OutputConfig::default(),
            template: TemplateConfig::default(),
            steps: Vec::new(),
            filters: Vec::new(),
            remotes: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Cache root; defaults to the user cache directory
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputConfig {
    /// Publish directory; emptied at the start of every batch
    pub dir: Option<PathBuf>,
}

/// Where templates come from. `text` wins over `files`, which win over `dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Inline template, published as `template.md`
    #[serde(default)]
    pub text: Option<String>,

    /// Template files, relative to `dir`
    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default = "default_template_dir")]
    pub dir: PathBuf,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            text: None,
            files: Vec::new(),
            dir: default_template_dir(),
        }
    }
}

/// One declared step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepConfig {
    pub id: String,

    /// Function reference (`name` or `source.name`); defaults to `id`
    #[serde(default)]
    pub function: Option<String>,

    /// Keyword arguments. `depends` is reserved for upstream step ids.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl StepConfig {
    pub fn new(id: &str, args: Value) -> Self {
        Self {
            id: id.to_string(),
            function: None,
            args: args.as_object().cloned().unwrap_or_default(),
        }
    }

    pub fn with_function(mut self, function: &str) -> Self {
        self.function = Some(function.to_string());
        self
    }

    pub fn function_ref(&self) -> &str {
        self.function.as_deref().unwrap_or(&self.id)
    }

    /// Upstream step ids from the reserved `depends` argument
    pub fn depends(&self) -> Result<Vec<String>> {
        match self.args.get(DEPENDS_ARG) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(id)) => Ok(vec![id.clone()]),
            Some(Value::Array(ids)) => ids
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        PrecisError::config(format!(
                            "step '{}': depends entries must be step ids, got {v}",
                            self.id
                        ))
                    })
                })
                .collect(),
            Some(other) => Err(PrecisError::config(format!(
                "step '{}': depends must be a list of step ids, got {other}",
                self.id
            ))),
        }
    }

    /// Whether the step declared `depends` at all (an empty list still counts)
    pub fn declares_depends(&self) -> bool {
        self.args.contains_key(DEPENDS_ARG)
    }

    /// Arguments passed to the function and hashed into its key
    pub fn call_args(&self) -> Map<String, Value> {
        let mut args = self.args.clone();
        args.remove(DEPENDS_ARG);
        args
    }
}

/// One filter stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterConfig {
    pub id: String,
    /// Output extension (without the dot)
    pub ext: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl FilterConfig {
    pub fn new(id: &str, ext: &str) -> Self {
        Self {
            id: id.to_string(),
            ext: ext.to_string(),
            options: Map::new(),
        }
    }
}

/// A remote storage backend instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    Filesystem {
        path: PathBuf,
    },
    Http {
        url: String,
        /// Environment variable holding a bearer token
        #[serde(default)]
        token_env: Option<String>,
        #[serde(default = "default_remote_timeout")]
        timeout_secs: u64,
    },
}

fn default_jobs() -> usize {
    1
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_remote_timeout() -> u64 {
    60
}

impl BatchConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(PrecisError::io(path))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        Self::parse(&content, base_dir).map_err(|e| match e {
            PrecisError::Configuration(msg) => {
                PrecisError::config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse TOML, resolving relative paths against `base_dir`
    pub fn parse(content: &str, base_dir: &Path) -> Result<Self> {
        let mut config: BatchConfig =
            toml::from_str(content).map_err(|e| PrecisError::config(e.to_string()))?;
        config.base_dir = base_dir.to_path_buf();
        Ok(config)
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file.as_deref().map(|path| self.resolve_path(path))
    }

    pub fn cache_dir(&self) -> PathBuf {
        match &self.cache.dir {
            Some(dir) => self.resolve_path(dir),
            None => default_cache_dir(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        match &self.output.dir {
            Some(dir) => self.resolve_path(dir),
            None => self.resolve_path(&default_output_dir()),
        }
    }

    pub fn template_dir(&self) -> PathBuf {
        self.resolve_path(&self.template.dir)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            return Err(PrecisError::config("jobs must be at least 1"));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(PrecisError::config("steps.id must not be empty"));
            }
            if step.function_ref().trim().is_empty() {
                return Err(PrecisError::config(format!(
                    "step '{}': function must not be empty",
                    step.id
                )));
            }
            // Dependencies must point backwards so declaration order is a valid schedule
            for dep in step.depends()? {
                if !seen.contains(dep.as_str()) {
                    return Err(PrecisError::config(format!(
                        "step '{}' depends on '{}', which is not declared before it",
                        step.id, dep
                    )));
                }
            }
            if !seen.insert(step.id.as_str()) {
                return Err(PrecisError::config(format!(
                    "step id '{}' is declared twice",
                    step.id
                )));
            }
        }

        for filter in &self.filters {
            if filter.id.trim().is_empty() {
                return Err(PrecisError::config("filters.id must not be empty"));
            }
            if filter.ext.is_empty() || filter.ext.contains(['/', '\\']) {
                return Err(PrecisError::config(format!(
                    "filter '{}': ext must be a bare extension like \"html\"",
                    filter.id
                )));
            }
        }

        for remote in &self.remotes {
            if let RemoteConfig::Http { url, .. } = remote {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(PrecisError::config(format!(
                        "remotes.url must start with http:// or https://: {url}"
                    )));
                }
            }
        }

        if self.template.text.is_none()
            && self.template.files.is_empty()
            && !self.template_dir().is_dir()
        {
            return Err(PrecisError::config(format!(
                "no template source: set template.text, template.files, or create {}",
                self.template_dir().display()
            )));
        }

        Ok(())
    }
}
