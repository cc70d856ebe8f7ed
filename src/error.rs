//! Error taxonomy for batches.
//!
//! Configuration, cache-consistency and execution failures are fatal and abort
//! the batch. Single-backend remote failures are logged by [`crate::remote`]
//! and only surface as [`PrecisError::Storage`] once every backend failed.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PrecisError>;

#[derive(Debug, Error)]
pub enum PrecisError {
    /// Unresolvable function, bad step declaration, missing template source.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Metadata was found but a file it references is unreachable everywhere.
    #[error("cache inconsistency for {key}: {message}")]
    CacheInconsistency { key: String, message: String },

    /// A step function returned an error. No metadata was written.
    #[error("step '{step}' failed: {source:#}")]
    Execution {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    /// A filter failed. Nothing from this template's chain is published.
    #[error("filter '{filter}' failed on '{document}': {source:#}")]
    Filter {
        filter: String,
        document: String,
        #[source]
        source: anyhow::Error,
    },

    /// Every configured remote backend failed to store a file.
    #[error("storage error: {0}")]
    Storage(String),

    /// No remote backend had the requested object.
    #[error("cache miss for {object}")]
    CacheMiss { object: String },

    #[error("not found in cache: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("batch cancelled")]
    Cancelled,

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PrecisError {
    /// Adapter for `map_err` on filesystem calls.
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| PrecisError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PrecisError::Configuration(message.into())
    }
}
