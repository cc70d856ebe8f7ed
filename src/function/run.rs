use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

use super::context::ExecutionContext;
use super::metadata::{MetadataEnvelope, METADATA_VERSION};
use super::registry::ResolvedFunction;
use crate::cache_key::{function_key, CacheKey};
use crate::cancel::CancelFlag;
use crate::error::{PrecisError, Result};
use crate::logging::{operations, services, status};
use crate::remote::RemoteSet;
use crate::storage::{CacheStore, METADATA_EXT};

/// Where an invocation is in its restore-or-execute protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    KeyComputed,
    RemoteLookup,
    Restored,
    Executing,
    MetadataSaved,
}

/// How a step was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Metadata was already in the local cache
    Local,
    /// Metadata and files were fetched from a remote backend
    Restored,
    /// The function ran
    Executed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Local => "local",
            RunOutcome::Restored => "restored",
            RunOutcome::Executed => "executed",
        }
    }
}

/// One declared step bound to its resolved function
///
/// The key is computed at construction from the function's canonical name
/// and fingerprint, the call arguments and the keys of upstream steps.
pub struct FunctionRun<'a> {
    step_id: String,
    function: ResolvedFunction,
    args: Map<String, Value>,
    key: CacheKey,
    state: RunState,
    store: &'a CacheStore,
    remotes: &'a RemoteSet,
    cancel: &'a CancelFlag,
}

impl<'a> FunctionRun<'a> {
    /// `depends` is `None` when the step declared no dependencies, which
    /// hashes differently from an empty list.
    pub fn new(
        step_id: &str,
        function: ResolvedFunction,
        args: Map<String, Value>,
        depends: Option<&[CacheKey]>,
        store: &'a CacheStore,
        remotes: &'a RemoteSet,
        cancel: &'a CancelFlag,
    ) -> Self {
        let key = function_key(
            &function.canonical_name,
            function.function.fingerprint(),
            &args,
            depends,
        );
        debug!(
            service = services::FUNCTION_RUN,
            step = step_id,
            function = %function.canonical_name,
            key = %key,
            "computed step key"
        );

        Self {
            step_id: step_id.to_string(),
            function,
            args,
            key,
            state: RunState::KeyComputed,
            store,
            remotes,
            cancel,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    /// Canonical `source.function` name
    pub fn function_name(&self) -> &str {
        &self.function.canonical_name
    }

    /// Local cache check only
    pub fn metadata_exists(&self) -> bool {
        self.store.exists(&self.key, METADATA_EXT)
    }

    pub fn load_metadata(&self) -> Result<MetadataEnvelope> {
        self.store.read_json(&self.key, METADATA_EXT)
    }

    /// Fetch metadata and every file it references from remote storage.
    ///
    /// `Ok(false)` when no backend has the metadata. Metadata without all of
    /// its files is a [`PrecisError::CacheInconsistency`].
    pub fn try_restore_from_remote(&mut self) -> Result<bool> {
        self.cancel.check()?;
        self.state = RunState::RemoteLookup;

        if !self.remotes.try_fetch(self.store, &self.key, METADATA_EXT)? {
            debug!(
                service = services::FUNCTION_RUN,
                operation = operations::RESTORE,
                status = status::MISS,
                step = %self.step_id,
                key = %self.key,
                "metadata not found remotely"
            );
            return Ok(false);
        }

        let envelope = self.load_metadata()?;
        if let Err(err) = self.ensure_files(&envelope) {
            // All or nothing: without its files the fetched metadata must not stay
            self.store.remove(&self.key, METADATA_EXT)?;
            return Err(err);
        }

        self.state = RunState::Restored;
        info!(
            service = services::FUNCTION_RUN,
            operation = operations::RESTORE,
            status = status::HIT,
            step = %self.step_id,
            key = %self.key,
            files = envelope.supplemental_files.len(),
            "restored from remote storage"
        );
        Ok(true)
    }

    /// Make every supplemental file of `envelope` present locally
    fn ensure_files(&self, envelope: &MetadataEnvelope) -> Result<()> {
        for file in envelope.supplemental_files.values() {
            self.cancel.check()?;
            if self.store.exists(&file.key, &file.ext) {
                continue;
            }
            if !self.remotes.try_fetch(self.store, &file.key, &file.ext)? {
                return Err(PrecisError::CacheInconsistency {
                    key: self.key.to_string(),
                    message: format!(
                        "metadata references '{}' ({}) but no cache has it",
                        file.canonical_name,
                        file.object_name()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Execute the function and persist its metadata.
    ///
    /// `upstream` holds the metadata of steps that completed earlier, for
    /// [`ExecutionContext::file_path`] lookups. A failing function leaves no
    /// metadata behind.
    pub fn run(
        &mut self,
        upstream: &BTreeMap<String, MetadataEnvelope>,
    ) -> Result<MetadataEnvelope> {
        self.cancel.check()?;
        self.state = RunState::Executing;
        info!(
            service = services::FUNCTION_RUN,
            operation = operations::EXECUTE,
            step = %self.step_id,
            function = %self.function.canonical_name,
            key = %self.key,
            "executing step"
        );

        let start = Instant::now();
        let mut ctx = ExecutionContext::new(
            &self.step_id,
            &self.key,
            self.store,
            self.remotes,
            upstream,
            self.cancel,
        );
        let output = match self.function.function.call(&mut ctx, &self.args) {
            Ok(output) => output,
            Err(_) if self.cancel.is_cancelled() => return Err(PrecisError::Cancelled),
            Err(source) => {
                return Err(PrecisError::Execution {
                    step: self.step_id.clone(),
                    source,
                })
            }
        };
        let elapsed = start.elapsed().as_secs_f64();
        let supplemental_files = ctx.into_files();

        let envelope = MetadataEnvelope {
            version: METADATA_VERSION,
            key: self.key.clone(),
            function: self.function.canonical_name.clone(),
            function_output: output,
            function_elapsed_seconds: elapsed,
            supplemental_files,
            created_at: Utc::now(),
        };

        let path = self.store.write_json(&self.key, METADATA_EXT, &envelope)?;
        self.remotes.broadcast(&path)?;
        self.state = RunState::MetadataSaved;

        info!(
            service = services::FUNCTION_RUN,
            operation = operations::EXECUTE,
            status = status::SUCCESS,
            step = %self.step_id,
            key = %self.key,
            elapsed_secs = elapsed,
            "step complete"
        );
        Ok(envelope)
    }

    /// Full protocol: local metadata, then remote restore, then execution
    pub fn execute_or_restore(
        &mut self,
        upstream: &BTreeMap<String, MetadataEnvelope>,
    ) -> Result<(MetadataEnvelope, RunOutcome)> {
        if self.metadata_exists() {
            let envelope = self.load_metadata()?;
            // Local metadata with a file evicted by hand must be repaired or refused
            self.ensure_files(&envelope)?;
            self.state = RunState::Restored;
            debug!(
                service = services::FUNCTION_RUN,
                operation = operations::LOAD,
                status = status::HIT,
                step = %self.step_id,
                key = %self.key,
                "metadata found locally"
            );
            return Ok((envelope, RunOutcome::Local));
        }

        if self.try_restore_from_remote()? {
            return Ok((self.load_metadata()?, RunOutcome::Restored));
        }

        let envelope = self.run(upstream)?;
        Ok((envelope, RunOutcome::Executed))
    }
}
