//! Batch orchestration
//!
//! A [`Batch`] turns the declared steps into [`FunctionRun`]s, threads each
//! step's key to the steps that depend on it, runs the restore-or-execute
//! protocol for all of them and finally renders every template through the
//! filter chain into the publish directory.

mod scheduler;

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

use crate::cache_key::CacheKey;
use crate::cancel::CancelFlag;
use crate::config::BatchConfig;
use crate::document::{
    publish, reset_output_dir, DocumentPipeline, ExpressionEngine, FilterRegistry,
    GeneratedDocument, TemplateData, TemplateEngine, TemplateSource,
};
use crate::error::{PrecisError, Result};
use crate::function::{FunctionRegistry, FunctionRun, ResolvedFunction, RunOutcome};
use crate::logging::{operations, services};
use crate::remote::{self, RemoteContext, RemoteSet, RemoteStorage};
use crate::storage::CacheStore;

use scheduler::ScheduledRun;

/// A configured batch, ready to plan or run
pub struct Batch {
    config: BatchConfig,
    registry: FunctionRegistry,
    filters: FilterRegistry,
    engine: Box<dyn TemplateEngine>,
    remotes: RemoteSet,
    cancel: CancelFlag,
    batch_id: String,
}

/// A declared step after function resolution
struct ResolvedStep {
    id: String,
    function: ResolvedFunction,
    args: serde_json::Map<String, serde_json::Value>,
    depends: Option<Vec<String>>,
}

/// What `plan` knows about a step without running anything
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub id: String,
    /// Canonical `source.function`
    pub function: String,
    pub key: CacheKey,
    /// Metadata is present in the local cache
    pub cached: bool,
    pub depends: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub id: String,
    pub key: CacheKey,
    pub outcome: RunOutcome,
    pub elapsed_seconds: f64,
}

/// Result of a completed batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub steps: Vec<StepReport>,
    pub documents: Vec<GeneratedDocument>,
    pub output_dir: PathBuf,
    /// Every file copied into `output_dir`
    pub published: Vec<PathBuf>,
}

impl BatchReport {
    /// Steps whose function actually ran
    pub fn executed(&self) -> usize {
        self.count(RunOutcome::Executed)
    }

    /// Steps satisfied from the local cache or a remote backend
    pub fn cached(&self) -> usize {
        self.steps.len() - self.executed()
    }

    fn count(&self, outcome: RunOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

impl Batch {
    /// Validate `config` and build its remote backends. Function resolution
    /// happens when the batch is planned or run.
    pub fn new(config: BatchConfig, registry: FunctionRegistry) -> Result<Self> {
        config.validate()?;

        let mut remotes = RemoteSet::new();
        for remote in &config.remotes {
            remotes.push(remote::from_config(remote, &config.base_dir));
        }

        let batch_id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            std::process::id()
        );

        Ok(Self {
            config,
            registry,
            filters: FilterRegistry::with_builtins(),
            engine: Box::new(ExpressionEngine),
            remotes,
            cancel: CancelFlag::new(),
            batch_id,
        })
    }

    /// Append a backend after those from the config
    pub fn add_remote(&mut self, backend: Box<dyn RemoteStorage>) {
        self.remotes.push(backend);
    }

    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_template_engine<E: TemplateEngine + 'static>(mut self, engine: E) -> Self {
        self.engine = Box::new(engine);
        self
    }

    /// Handle that cancels this batch from another thread
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Compute every step key and check the local cache, without executing
    /// anything or contacting remote backends
    pub fn plan(&self) -> Result<Vec<PlannedStep>> {
        let store = CacheStore::new(self.config.cache_dir())?;
        let steps = self.resolve_steps()?;
        let runs = self.build_runs(steps, &store, &self.remotes)?;

        Ok(runs
            .into_iter()
            .map(|scheduled| PlannedStep {
                id: scheduled.run.step_id().to_string(),
                function: scheduled.run.function_name().to_string(),
                key: scheduled.run.key().clone(),
                cached: scheduled.run.metadata_exists(),
                depends: scheduled.depends,
            })
            .collect())
    }

    /// Run every step, render every template through the filter chain and
    /// publish the results
    pub fn run(&mut self) -> Result<BatchReport> {
        let started = Instant::now();
        let steps = self.resolve_steps()?;
        let templates = self.templates()?;

        let cache_dir = self.config.cache_dir();
        let store = CacheStore::new(&cache_dir)?;
        self.remotes.connect_all(&RemoteContext {
            batch_id: self.batch_id.clone(),
            cache_dir,
            cancel: self.cancel.clone(),
        })?;

        info!(
            service = services::BATCH,
            batch = %self.batch_id,
            steps = steps.len(),
            templates = templates.len(),
            filters = self.config.filters.len(),
            remotes = self.remotes.len(),
            "starting batch"
        );

        let render_dir = store.scratch_dir("render-")?;
        let pipeline = DocumentPipeline::new(
            &store,
            &self.remotes,
            self.engine.as_ref(),
            &self.filters,
            &self.config.filters,
            &self.cancel,
            render_dir.path(),
        );
        pipeline.validate_chain()?;

        let runs = self.build_runs(steps, &store, &self.remotes)?;

        let output_dir = self.config.output_dir();
        reset_output_dir(&output_dir)?;

        let results = scheduler::execute(runs, self.config.jobs, &self.cancel)?;

        let mut data = TemplateData::new();
        for result in &results {
            let files = result
                .envelope
                .supplemental_files
                .values()
                .map(|f| (f.canonical_name.clone(), store.entry_path(&f.key, &f.ext)));
            data.insert_step(&result.id, &result.args, &result.envelope, files);
        }

        let mut documents = Vec::new();
        for template in &templates {
            documents.extend(pipeline.process(template, &data)?);
        }
        let published = publish(&documents, &data, &output_dir)?;

        let steps: Vec<StepReport> = results
            .into_iter()
            .map(|r| StepReport {
                id: r.id,
                key: r.key,
                outcome: r.outcome,
                elapsed_seconds: r.elapsed.as_secs_f64(),
            })
            .collect();
        let report = BatchReport {
            batch_id: self.batch_id.clone(),
            steps,
            documents,
            output_dir,
            published,
        };

        info!(
            service = services::BATCH,
            batch = %report.batch_id,
            executed = report.executed(),
            cached = report.cached(),
            documents = report.documents.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "batch complete"
        );
        Ok(report)
    }

    fn resolve_steps(&self) -> Result<Vec<ResolvedStep>> {
        self.config
            .steps
            .iter()
            .map(|step| {
                let function = self.registry.resolve(step.function_ref())?;
                debug!(
                    service = services::BATCH,
                    operation = operations::RESOLVE,
                    step = %step.id,
                    function = %function.canonical_name,
                    "resolved step function"
                );
                Ok(ResolvedStep {
                    id: step.id.clone(),
                    function,
                    args: step.call_args(),
                    depends: step
                        .declares_depends()
                        .then(|| step.depends())
                        .transpose()?,
                })
            })
            .collect()
    }

    /// Bind steps to the store, computing keys in declaration order so each
    /// step sees the keys of the steps it depends on
    fn build_runs<'a>(
        &'a self,
        steps: Vec<ResolvedStep>,
        store: &'a CacheStore,
        remotes: &'a RemoteSet,
    ) -> Result<Vec<ScheduledRun<'a>>> {
        let mut keys: HashMap<String, CacheKey> = HashMap::new();
        let mut runs = Vec::with_capacity(steps.len());

        for step in steps {
            let depends_keys = step
                .depends
                .as_ref()
                .map(|ids| {
                    ids.iter()
                        .map(|id| {
                            keys.get(id).cloned().ok_or_else(|| {
                                PrecisError::config(format!(
                                    "step '{}' depends on unknown step '{}'",
                                    step.id, id
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?;

            let run = FunctionRun::new(
                &step.id,
                step.function,
                step.args,
                depends_keys.as_deref(),
                store,
                remotes,
                &self.cancel,
            );
            keys.insert(step.id, run.key().clone());
            runs.push(ScheduledRun {
                run,
                depends: step.depends.unwrap_or_default(),
            });
        }

        Ok(runs)
    }

    /// Inline text, then explicit files, then every file in the template dir
    fn templates(&self) -> Result<Vec<TemplateSource>> {
        let template = &self.config.template;
        if let Some(text) = &template.text {
            return Ok(vec![TemplateSource::inline(text)]);
        }

        let dir = self.config.template_dir();
        let paths: Vec<PathBuf> = if template.files.is_empty() {
            let pattern = dir.join("*");
            let mut paths = Vec::new();
            for entry in glob::glob(&pattern.to_string_lossy())
                .map_err(|e| PrecisError::config(format!("bad template dir: {e}")))?
            {
                let path = entry.map_err(|e| PrecisError::Io {
                    path: e.path().to_path_buf(),
                    source: e.into_error(),
                })?;
                if path.is_file() {
                    paths.push(path);
                }
            }
            paths.sort();
            paths
        } else {
            template.files.iter().map(|f| dir.join(f)).collect()
        };

        if paths.is_empty() {
            return Err(PrecisError::config(format!(
                "no templates found in {}",
                dir.display()
            )));
        }

        paths
            .iter()
            .map(|path| {
                if !path.is_file() {
                    return Err(PrecisError::config(format!(
                        "template file not found: {}",
                        path.display()
                    )));
                }
                TemplateSource::from_file(path)
            })
            .collect()
    }
}
