use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

use super::metadata::{file_ext, MetadataEnvelope, SupplementalFile};
use crate::cache_key::{supplemental_file_key, CacheKey};
use crate::cancel::CancelFlag;
use crate::error::{PrecisError, Result};
use crate::logging::{operations, services};
use crate::remote::RemoteSet;
use crate::storage::CacheStore;

/// What a step function sees while it runs
///
/// Files a function produces are written straight to their cache-addressed
/// path and then registered; registration uploads them to every remote and
/// records them in the step's metadata.
pub struct ExecutionContext<'a> {
    step_id: &'a str,
    key: &'a CacheKey,
    store: &'a CacheStore,
    remotes: &'a RemoteSet,
    upstream: &'a BTreeMap<String, MetadataEnvelope>,
    cancel: &'a CancelFlag,
    files: BTreeMap<String, SupplementalFile>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        step_id: &'a str,
        key: &'a CacheKey,
        store: &'a CacheStore,
        remotes: &'a RemoteSet,
        upstream: &'a BTreeMap<String, MetadataEnvelope>,
        cancel: &'a CancelFlag,
    ) -> Self {
        Self {
            step_id,
            key,
            store,
            remotes,
            upstream,
            cancel,
            files: BTreeMap::new(),
        }
    }

    pub fn step_id(&self) -> &str {
        self.step_id
    }

    pub fn key(&self) -> &CacheKey {
        self.key
    }

    pub fn cancel(&self) -> &CancelFlag {
        self.cancel
    }

    /// Cache-addressed path for a file this step produces
    pub fn cache_path(&self, canonical_name: &str) -> Result<PathBuf> {
        let key = supplemental_file_key(self.key, canonical_name);
        self.store.path_for(&key, &file_ext(canonical_name))
    }

    /// Record a file already written at [`ExecutionContext::cache_path`]
    pub fn register_file(&mut self, canonical_name: &str) -> Result<&SupplementalFile> {
        let key = supplemental_file_key(self.key, canonical_name);
        let ext = file_ext(canonical_name);
        let path = self.store.entry_path(&key, &ext);
        if !path.is_file() {
            return Err(PrecisError::NotFound { path });
        }

        let public_urls = self.remotes.broadcast(&path)?;
        info!(
            service = services::FUNCTION_RUN,
            operation = operations::REGISTER,
            step = self.step_id,
            file = canonical_name,
            key = %key,
            "registered supplemental file"
        );

        let file = SupplementalFile {
            canonical_name: canonical_name.to_string(),
            ext,
            key,
            public_urls,
        };
        self.files.insert(canonical_name.to_string(), file);
        Ok(&self.files[canonical_name])
    }

    /// Write a file through `write` into the cache and register it.
    ///
    /// The content goes to a temp file first; if `write` fails nothing is
    /// stored or registered.
    pub fn generate_file<F>(&mut self, canonical_name: &str, write: F) -> anyhow::Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> anyhow::Result<()>,
    {
        self.cancel.check()?;
        let key = supplemental_file_key(self.key, canonical_name);
        let mut staged = self.store.stage(&key, &file_ext(canonical_name))?;
        write(&mut staged)?;
        let path = staged.commit()?;
        self.register_file(canonical_name)?;
        Ok(path)
    }

    /// Copy an existing file into the cache and register it
    pub fn add_existing_file(&mut self, source: &Path, canonical_name: &str) -> Result<PathBuf> {
        self.cancel.check()?;
        let key = supplemental_file_key(self.key, canonical_name);
        let path = self
            .store
            .import(&key, &file_ext(canonical_name), source)?;
        self.register_file(canonical_name)?;
        Ok(path)
    }

    /// Cached path of a supplemental file from this step or an earlier one.
    ///
    /// Files of earlier steps that are only known remotely are fetched first.
    pub fn file_path(&self, canonical_name: &str, from: Option<&str>) -> Result<PathBuf> {
        let file = match from {
            None => self.files.get(canonical_name).ok_or_else(|| {
                PrecisError::config(format!(
                    "step '{}' has not registered '{}'",
                    self.step_id, canonical_name
                ))
            })?,
            Some(step) => self
                .upstream
                .get(step)
                .ok_or_else(|| {
                    PrecisError::config(format!(
                        "step '{}' reads from '{}', which has not run yet (declare it in depends)",
                        self.step_id, step
                    ))
                })?
                .supplemental_files
                .get(canonical_name)
                .ok_or_else(|| {
                    PrecisError::config(format!(
                        "step '{step}' did not register '{canonical_name}'"
                    ))
                })?,
        };

        let path = self.store.entry_path(&file.key, &file.ext);
        if !path.is_file() {
            debug!(
                step = self.step_id,
                file = canonical_name,
                "supplemental file missing locally, fetching"
            );
            return self.remotes.fetch(self.store, &file.key, &file.ext);
        }
        Ok(path)
    }

    /// Open a supplemental file for reading
    pub fn read_file(&self, canonical_name: &str, from: Option<&str>) -> Result<fs::File> {
        let path = self.file_path(canonical_name, from)?;
        fs::File::open(&path).map_err(PrecisError::io(&path))
    }

    pub fn read_to_string(&self, canonical_name: &str, from: Option<&str>) -> Result<String> {
        let path = self.file_path(canonical_name, from)?;
        fs::read_to_string(&path).map_err(PrecisError::io(&path))
    }

    /// Private scratch directory, removed when dropped
    pub fn scratch_dir(&self) -> Result<TempDir> {
        self.store.scratch_dir(&format!("step-{}-", self.step_id))
    }

    pub(crate) fn into_files(self) -> BTreeMap<String, SupplementalFile> {
        self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::template_text_key;
    use std::io::Read;

    struct Fixture {
        _temp: TempDir,
        store: CacheStore,
        remotes: RemoteSet,
        upstream: BTreeMap<String, MetadataEnvelope>,
        cancel: CancelFlag,
        key: CacheKey,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache")).unwrap();
        Fixture {
            _temp: temp,
            store,
            remotes: RemoteSet::new(),
            upstream: BTreeMap::new(),
            cancel: CancelFlag::new(),
            key: template_text_key("step"),
        }
    }

    impl Fixture {
        fn context(&self) -> ExecutionContext<'_> {
            ExecutionContext::new(
                "report",
                &self.key,
                &self.store,
                &self.remotes,
                &self.upstream,
                &self.cancel,
            )
        }
    }

    #[test]
    fn test_generate_then_read_back() {
        let fx = fixture();
        let mut ctx = fx.context();

        let path = ctx
            .generate_file("table.csv", |w| {
                w.write_all(b"a,b\n1,2\n")?;
                Ok(())
            })
            .unwrap();

        assert!(path.to_string_lossy().ends_with(".csv"));
        assert_eq!(ctx.read_to_string("table.csv", None).unwrap(), "a,b\n1,2\n");

        let mut content = String::new();
        ctx.read_file("table.csv", None)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "a,b\n1,2\n");
        assert_eq!(ctx.into_files().len(), 1);
    }

    #[test]
    fn test_failed_generate_registers_nothing() {
        let fx = fixture();
        let mut ctx = fx.context();

        let result = ctx.generate_file("broken.txt", |w| {
            w.write_all(b"half")?;
            anyhow::bail!("renderer crashed")
        });

        assert!(result.is_err());
        assert!(!ctx.cache_path("broken.txt").unwrap().exists());
        assert!(ctx.into_files().is_empty());
    }

    #[test]
    fn test_register_requires_file_at_cache_path() {
        let fx = fixture();
        let mut ctx = fx.context();

        assert!(matches!(
            ctx.register_file("missing.png"),
            Err(PrecisError::NotFound { .. })
        ));

        fs::write(ctx.cache_path("chart.png").unwrap(), b"png").unwrap();
        let file = ctx.register_file("chart.png").unwrap();
        assert_eq!(file.ext, "png");
        assert_eq!(file.key, supplemental_file_key(&fx.key, "chart.png"));
    }

    #[test]
    fn test_read_from_unknown_step() {
        let fx = fixture();
        let ctx = fx.context();
        assert!(matches!(
            ctx.read_to_string("data.csv", Some("extract")),
            Err(PrecisError::Configuration(_))
        ));
    }
}
