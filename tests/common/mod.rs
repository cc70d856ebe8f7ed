// Common test utilities shared across acceptance tests
//
// Every test gets its own workspace: a temp directory holding the cache,
// the publish directory and (when needed) a filesystem "bucket" used as a
// remote backend. Nothing touches the user's cache directory.

#![allow(dead_code)]

use precis::config::{BatchConfig, CacheConfig, OutputConfig, StepConfig};
use precis::{FunctionRegistry, FunctionSource, StepFunction};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path().join("cache")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path().join("output")
    }

    pub fn bucket_dir(&self) -> PathBuf {
        self.path().join("bucket")
    }

    pub fn output(&self, name: &str) -> String {
        std::fs::read_to_string(self.output_dir().join(name)).unwrap()
    }

    /// Config with an inline template and the workspace's directories
    pub fn config(&self, template: &str, steps: Vec<StepConfig>) -> BatchConfig {
        let mut config = BatchConfig {
            base_dir: self.path().to_path_buf(),
            cache: CacheConfig {
                dir: Some(self.cache_dir()),
            },
            output: OutputConfig {
                dir: Some(self.output_dir()),
            },
            steps,
            ..BatchConfig::default()
        };
        config.template.text = Some(template.to_string());
        config
    }

    /// Same workspace layout but a different cache, as on another machine
    pub fn config_with_cache(
        &self,
        cache: &Path,
        template: &str,
        steps: Vec<StepConfig>,
    ) -> BatchConfig {
        let mut config = self.config(template, steps);
        config.cache.dir = Some(cache.to_path_buf());
        config
    }
}

/// Counts how often each registered function body runs
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// `math` source: `add(a, b)`, `double(x)` and `table(rows)`.
///
/// `table` writes `table.csv` as a supplemental file; `summary` reads it back
/// from the `table` step.
pub fn math_registry(calls: &CallCounter) -> FunctionRegistry {
    let add_calls = calls.clone();
    let add = StepFunction::new("add", "add/1", move |_ctx, args| {
        add_calls.hit();
        let a = args["a"].as_i64().unwrap_or(0);
        let b = args["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });

    let double_calls = calls.clone();
    let double = StepFunction::new("double", "double/1", move |_ctx, args| {
        double_calls.hit();
        Ok(json!(args["x"].as_i64().unwrap_or(0) * 2))
    });

    let table_calls = calls.clone();
    let table = StepFunction::new("table", "table/1", move |ctx, args| {
        table_calls.hit();
        let rows = args["rows"].as_i64().unwrap_or(0);
        ctx.generate_file("table.csv", |w| {
            writeln!(w, "n,square")?;
            for n in 1..=rows {
                writeln!(w, "{n},{}", n * n)?;
            }
            Ok(())
        })?;
        Ok(json!(rows))
    });

    let summary_calls = calls.clone();
    let summary = StepFunction::new("summary", "summary/1", move |ctx, _args| {
        summary_calls.hit();
        let csv = ctx.read_to_string("table.csv", Some("table"))?;
        Ok(json!(csv.lines().count() - 1))
    });

    FunctionRegistry::new().with_source(
        FunctionSource::new("math")
            .with(add)
            .with(double)
            .with(table)
            .with(summary),
    )
}
