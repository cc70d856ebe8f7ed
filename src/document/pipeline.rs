use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::filters::{FilterContext, FilterRegistry};
use super::template::{TemplateData, TemplateEngine, TemplateSource};
use crate::cache_key::{document_key, hash_file, CacheKey};
use crate::cancel::CancelFlag;
use crate::config::FilterConfig;
use crate::error::{PrecisError, Result};
use crate::logging::{operations, services, status};
use crate::remote::RemoteSet;
use crate::storage::CacheStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Rendered template
    Template,
    /// Output of a filter stage
    Filter,
}

/// One stage's output
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedDocument {
    /// Human-facing name used in the publish directory
    pub canonical_name: String,
    pub key: CacheKey,
    /// Where the bytes live: the cache for filter output, the batch's render
    /// directory for templates
    pub path: PathBuf,
    pub kind: DocumentKind,
    pub public_urls: Vec<String>,
    /// Served from a cache instead of running the stage
    pub cached: bool,
}

/// Renders one template and runs it through the filter chain
///
/// Every filter runs in its own scratch directory holding a copy of its
/// input and of all supplemental files, so filters never share a working
/// directory and the process's own current directory is never changed.
pub struct DocumentPipeline<'a> {
    store: &'a CacheStore,
    remotes: &'a RemoteSet,
    engine: &'a dyn TemplateEngine,
    filters: &'a FilterRegistry,
    chain: &'a [FilterConfig],
    cancel: &'a CancelFlag,
    render_dir: &'a Path,
}

impl<'a> DocumentPipeline<'a> {
    /// `render_dir` receives rendered templates and must outlive publishing
    pub fn new(
        store: &'a CacheStore,
        remotes: &'a RemoteSet,
        engine: &'a dyn TemplateEngine,
        filters: &'a FilterRegistry,
        chain: &'a [FilterConfig],
        cancel: &'a CancelFlag,
        render_dir: &'a Path,
    ) -> Self {
        Self {
            store,
            remotes,
            engine,
            filters,
            chain,
            cancel,
            render_dir,
        }
    }

    /// Fail fast on filter ids nothing is registered for
    pub fn validate_chain(&self) -> Result<()> {
        for stage in self.chain {
            if !self.filters.contains(&stage.id) {
                return Err(PrecisError::config(format!(
                    "unknown filter '{}'; available: [{}]",
                    stage.id,
                    self.filters.ids().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Render `template` and apply every filter. Returns the template
    /// document followed by one document per filter, in chain order.
    pub fn process(
        &self,
        template: &TemplateSource,
        data: &TemplateData,
    ) -> Result<Vec<GeneratedDocument>> {
        let mut documents = vec![self.render(template, data)?];
        for stage in self.chain {
            let previous = documents.last().ok_or_else(|| {
                PrecisError::config("filter chain has no input document")
            })?;
            let next = self.apply_filter(previous, stage, data)?;
            documents.push(next);
        }
        Ok(documents)
    }

    fn render(&self, template: &TemplateSource, data: &TemplateData) -> Result<GeneratedDocument> {
        self.cancel.check()?;
        let text = self
            .engine
            .render(&template.text, data)
            .map_err(|source| PrecisError::Filter {
                filter: "template".to_string(),
                document: template.canonical_name.clone(),
                source,
            })?;

        let dir = self.render_dir.join(template.key.as_str());
        let path = dir.join(&template.canonical_name);
        write_creating_parents(&path, text.as_bytes())?;

        info!(
            service = services::PIPELINE,
            operation = operations::RENDER,
            document = %template.canonical_name,
            key = %template.key,
            "rendered template"
        );

        Ok(GeneratedDocument {
            canonical_name: template.canonical_name.clone(),
            key: template.key.clone(),
            path,
            kind: DocumentKind::Template,
            public_urls: Vec::new(),
            cached: false,
        })
    }

    fn apply_filter(
        &self,
        previous: &GeneratedDocument,
        stage: &FilterConfig,
        data: &TemplateData,
    ) -> Result<GeneratedDocument> {
        self.cancel.check()?;
        let filter = self.filters.get(&stage.id).ok_or_else(|| {
            PrecisError::config(format!("unknown filter '{}'", stage.id))
        })?;

        let input_digest = hash_file(&previous.path)?;
        let key = document_key(
            &previous.key,
            &stage.id,
            &stage.ext,
            &stage.options,
            &input_digest,
        );
        let canonical_name = Path::new(&previous.canonical_name)
            .with_extension(&stage.ext)
            .to_string_lossy()
            .into_owned();

        if self.store.exists(&key, &stage.ext)
            || self.remotes.try_fetch(self.store, &key, &stage.ext)?
        {
            let path = self.store.entry_path(&key, &stage.ext);
            // Collects locators; backends already holding the object keep it
            let public_urls = self.remotes.broadcast(&path)?;
            debug!(
                service = services::PIPELINE,
                operation = operations::FILTER,
                status = status::HIT,
                filter = %stage.id,
                document = %canonical_name,
                key = %key,
                "filter output cached"
            );
            return Ok(GeneratedDocument {
                canonical_name,
                path,
                key,
                kind: DocumentKind::Filter,
                public_urls,
                cached: true,
            });
        }

        let scratch = self.store.scratch_dir("filter-")?;
        let work_dir = scratch.path();
        for (name, path) in data.files() {
            copy_creating_parents(path, &work_dir.join(name))?;
        }
        let input = work_dir.join(&previous.canonical_name);
        copy_creating_parents(&previous.path, &input)?;

        // A filter that keeps the extension must not overwrite its own input
        let output = if canonical_name == previous.canonical_name {
            work_dir.join("output").join(&canonical_name)
        } else {
            work_dir.join(&canonical_name)
        };
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(PrecisError::io(parent))?;
        }

        let ctx = FilterContext {
            work_dir,
            document: &previous.canonical_name,
            cancel: self.cancel,
        };
        let filter_error = |source| PrecisError::Filter {
            filter: stage.id.clone(),
            document: previous.canonical_name.clone(),
            source,
        };
        filter
            .apply(&ctx, &input, &output, &stage.ext, &stage.options)
            .map_err(|e| {
                if self.cancel.is_cancelled() {
                    PrecisError::Cancelled
                } else {
                    filter_error(e)
                }
            })?;
        if !output.is_file() {
            return Err(filter_error(anyhow::anyhow!(
                "filter did not produce {}",
                canonical_name
            )));
        }

        let path = self.store.import(&key, &stage.ext, &output)?;
        let public_urls = self.remotes.broadcast(&path)?;

        info!(
            service = services::PIPELINE,
            operation = operations::FILTER,
            status = status::SUCCESS,
            filter = %stage.id,
            document = %canonical_name,
            key = %key,
            "filter applied"
        );

        Ok(GeneratedDocument {
            canonical_name,
            key,
            path,
            kind: DocumentKind::Filter,
            public_urls,
            cached: false,
        })
    }
}

/// Empty `dir` (creating it if needed) so it only holds this batch's output
pub fn reset_output_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(PrecisError::io(dir))?;
    }
    fs::create_dir_all(dir).map_err(PrecisError::io(dir))
}

/// Copy documents and supplemental files into `output_dir` under their
/// canonical names
pub fn publish(
    documents: &[GeneratedDocument],
    data: &TemplateData,
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut published = Vec::new();

    for (name, path) in data.files() {
        let dest = output_dir.join(name);
        copy_creating_parents(path, &dest)?;
        published.push(dest);
    }
    for document in documents {
        let dest = output_dir.join(&document.canonical_name);
        copy_creating_parents(&document.path, &dest)?;
        debug!(
            service = services::PIPELINE,
            operation = operations::PUBLISH,
            document = %document.canonical_name,
            key = %document.key,
            "published"
        );
        published.push(dest);
    }

    info!(
        service = services::PIPELINE,
        operation = operations::PUBLISH,
        files = published.len(),
        output_dir = %output_dir.display(),
        "published documents"
    );
    Ok(published)
}

fn copy_creating_parents(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(PrecisError::io(parent))?;
    }
    fs::copy(source, dest).map_err(PrecisError::io(source))?;
    Ok(())
}

fn write_creating_parents(dest: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(PrecisError::io(parent))?;
    }
    fs::write(dest, data).map_err(PrecisError::io(dest))
}
