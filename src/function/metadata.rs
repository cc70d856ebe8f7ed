use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::cache_key::CacheKey;
use crate::storage::object_name;

/// Bumped when the envelope layout changes incompatibly
pub const METADATA_VERSION: u32 = 1;

/// Persisted record of one successful invocation
///
/// Written once, after the function returned, under `<key>.meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataEnvelope {
    pub version: u32,
    pub key: CacheKey,
    /// Canonical `source.function` name that produced it
    pub function: String,
    pub function_output: Value,
    pub function_elapsed_seconds: f64,
    #[serde(default)]
    pub supplemental_files: BTreeMap<String, SupplementalFile>,
    pub created_at: DateTime<Utc>,
}

/// A side artifact registered by a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupplementalFile {
    pub canonical_name: String,
    /// Extension of the canonical name, kept on the cached copy
    pub ext: String,
    pub key: CacheKey,
    #[serde(default)]
    pub public_urls: Vec<String>,
}

impl SupplementalFile {
    /// Name of the cached copy (`<key>.<ext>`)
    pub fn object_name(&self) -> String {
        object_name(&self.key, &self.ext)
    }
}

/// Extension used for a supplemental file's cached copy
pub fn file_ext(canonical_name: &str) -> String {
    Path::new(canonical_name)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default()
}
