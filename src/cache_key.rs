/// Cache key generation
///
/// Keys are SHA256 digests over a canonical rendering of named facts:
/// `name: value` pairs sorted by name and joined with `;`, where every value
/// is rendered as JSON with object keys sorted recursively. Equal facts always
/// produce equal keys regardless of argument declaration order.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{PrecisError, Result};

/// Hex-encoded SHA256 digest identifying an invocation or artifact.
///
/// Deserialization goes through [`CacheKey::parse`], so a damaged metadata
/// file can never produce a key too short to shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Accept an externally supplied key (e.g. from the command line).
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PrecisError::config(format!(
                "'{s}' is not a 64 character hex cache key"
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard directory name.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl TryFrom<String> for CacheKey {
    type Error = PrecisError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered set of named facts that determine a key.
#[derive(Debug, Default, Clone)]
pub struct Facts {
    entries: BTreeMap<String, String>,
}

impl Facts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fact. Values are canonicalized so nested maps hash identically
    /// no matter how they were built.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.entries
            .insert(name.to_string(), canonical_json(&value.into()));
        self
    }

    /// The exact string that gets hashed.
    pub fn canonical(&self) -> String {
        self.entries
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn digest(&self) -> CacheKey {
        CacheKey(hash_bytes(self.canonical().as_bytes()))
    }
}

/// Hash raw bytes with SHA256, hex-encoded
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash a file's contents
pub fn hash_file(path: &Path) -> Result<String> {
    let data = fs::read(path).map_err(PrecisError::io(path))?;
    Ok(hash_bytes(&data))
}

/// Key for one step invocation.
///
/// `fingerprint` is the version tag a function declares; bumping it
/// invalidates every cached result of that function. `depends` holds the
/// keys (not the ids) of upstream steps so that renaming a dependency does
/// not invalidate anything while any change upstream propagates downstream.
pub fn function_key(
    function_name: &str,
    fingerprint: &str,
    args: &Map<String, Value>,
    depends: Option<&[CacheKey]>,
) -> CacheKey {
    let depends = match depends {
        Some(keys) => Value::Array(keys.iter().map(|k| Value::from(k.as_str())).collect()),
        None => Value::Null,
    };

    Facts::new()
        .with("canonical_function_name", function_name)
        .with("fn_fingerprint", fingerprint)
        .with("arg_values", Value::Object(args.clone()))
        .with("depends", depends)
        .digest()
}

/// Key for a supplemental file registered by a step.
pub fn supplemental_file_key(step_key: &CacheKey, canonical_name: &str) -> CacheKey {
    Facts::new()
        .with("fn_hash", step_key.as_str())
        .with("filename", canonical_name)
        .digest()
}

/// Key for an inline template, derived from its text only.
pub fn template_text_key(text: &str) -> CacheKey {
    Facts::new()
        .with("template_contents", hash_bytes(text.as_bytes()))
        .digest()
}

/// Key for a file-backed template, derived from its contents only.
pub fn template_file_key(path: &Path) -> Result<CacheKey> {
    Ok(Facts::new()
        .with("template_contents", hash_file(path)?)
        .digest())
}

/// Key for the output of one filter stage.
///
/// `input_digest` is the content hash of the stage's input file. Template keys
/// only cover template text, so the rendered content has to be part of the
/// filter key or new data would be served from a stale document.
pub fn document_key(
    previous: &CacheKey,
    filter_id: &str,
    output_ext: &str,
    options: &Map<String, Value>,
    input_digest: &str,
) -> CacheKey {
    Facts::new()
        .with("previous_document", previous.as_str())
        .with("filter", filter_id)
        .with("output_ext", output_ext)
        .with("filter_args", Value::Object(options.clone()))
        .with("input_digest", input_digest)
        .digest()
}

/// Render JSON with object keys sorted at every depth.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::from(k.as_str()), canonical_json(&map[k])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}
