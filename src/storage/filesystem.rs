use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::cache_key::CacheKey;
use crate::error::{PrecisError, Result};
use crate::logging::{operations, services};

/// Extension reserved for serialized metadata envelopes
pub const METADATA_EXT: &str = "meta.json";

/// File name of an object in the cache: `<key>.<ext>`, or just `<key>`
pub fn object_name(key: &CacheKey, ext: &str) -> String {
    if ext.is_empty() {
        key.to_string()
    } else {
        format!("{key}.{ext}")
    }
}

/// Local content-addressed cache
///
/// Layout:
/// - `<root>/ab/abcd1234....<ext>` - cached objects (first 2 key chars = shard)
/// - `<root>/work/` - scratch directories for filter stages and shell steps
///
/// Entries are immutable: every write goes to a temp file in the shard
/// directory and is renamed into place, so readers never observe a partial
/// file, and writing a key that already exists is a no-op.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(PrecisError::io(&root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where an entry lives. Pure: a key always maps to the same shard path.
    pub fn entry_path(&self, key: &CacheKey, ext: &str) -> PathBuf {
        self.root.join(key.shard()).join(object_name(key, ext))
    }

    /// Entry path, creating the shard directory if it is missing
    pub fn path_for(&self, key: &CacheKey, ext: &str) -> Result<PathBuf> {
        let shard = self.root.join(key.shard());
        // create_dir_all tolerates a concurrent creator winning the race
        fs::create_dir_all(&shard).map_err(PrecisError::io(&shard))?;
        Ok(self.entry_path(key, ext))
    }

    pub fn exists(&self, key: &CacheKey, ext: &str) -> bool {
        self.entry_path(key, ext).is_file()
    }

    /// Store bytes under `key`. The first writer wins.
    pub fn write(&self, key: &CacheKey, ext: &str, data: &[u8]) -> Result<PathBuf> {
        if self.exists(key, ext) {
            return Ok(self.entry_path(key, ext));
        }
        let mut entry = self.stage(key, ext)?;
        entry.write_all(data).map_err(PrecisError::io(&entry.temp_path))?;
        entry.commit()
    }

    /// Open a temp file in the key's shard; the entry only becomes visible
    /// under its final name once [`StagedEntry::commit`] is called.
    pub fn stage(&self, key: &CacheKey, ext: &str) -> Result<StagedEntry> {
        let final_path = self.path_for(key, ext)?;
        let temp_path = temp_path_for(&final_path);
        let file = fs::File::create(&temp_path).map_err(PrecisError::io(&temp_path))?;
        Ok(StagedEntry {
            file: Some(file),
            temp_path,
            final_path,
            key: key.clone(),
            committed: false,
        })
    }

    /// Copy an existing file into the cache under `key`
    pub fn import(&self, key: &CacheKey, ext: &str, source: &Path) -> Result<PathBuf> {
        if self.exists(key, ext) {
            return Ok(self.entry_path(key, ext));
        }
        let mut input = fs::File::open(source).map_err(PrecisError::io(source))?;
        let mut entry = self.stage(key, ext)?;
        std::io::copy(&mut input, &mut entry).map_err(PrecisError::io(source))?;
        entry.commit()
    }

    /// Drop an entry; a missing entry is not an error
    pub fn remove(&self, key: &CacheKey, ext: &str) -> Result<()> {
        let path = self.entry_path(key, ext);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PrecisError::io(&path)(e)),
        }
    }

    pub fn read(&self, key: &CacheKey, ext: &str) -> Result<Vec<u8>> {
        let path = self.entry_path(key, ext);
        if !path.is_file() {
            return Err(PrecisError::NotFound { path });
        }
        fs::read(&path).map_err(PrecisError::io(&path))
    }

    pub fn write_json<T: Serialize>(
        &self,
        key: &CacheKey,
        ext: &str,
        value: &T,
    ) -> Result<PathBuf> {
        let data = serde_json::to_vec_pretty(value).map_err(|source| PrecisError::Serialization {
            what: object_name(key, ext),
            source,
        })?;
        self.write(key, ext, &data)
    }

    pub fn read_json<T: DeserializeOwned>(&self, key: &CacheKey, ext: &str) -> Result<T> {
        let data = self.read(key, ext)?;
        serde_json::from_slice(&data).map_err(|source| PrecisError::Serialization {
            what: object_name(key, ext),
            source,
        })
    }

    /// A fresh scratch directory under `<root>/work`, removed when dropped
    pub fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        let work = self.root.join("work");
        fs::create_dir_all(&work).map_err(PrecisError::io(&work))?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&work)
            .map_err(PrecisError::io(&work))
    }

    /// Count entries and bytes, skipping scratch directories
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats {
            total_objects: 0,
            total_bytes: 0,
            metadata_entries: 0,
            cache_dir: self.root.clone(),
        };

        for entry in WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name().len() == 2)
        {
            let entry = entry.map_err(|e| PrecisError::Io {
                path: self.root.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.contains(".tmp.") {
                continue;
            }
            stats.total_objects += 1;
            if name.ends_with(METADATA_EXT) {
                stats.metadata_entries += 1;
            }
            stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }

        Ok(stats)
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_objects: u64,
    pub total_bytes: u64,
    pub metadata_entries: u64,
    pub cache_dir: PathBuf,
}

/// An uncommitted cache entry. Dropping it without committing removes the
/// temp file, so a failed or cancelled producer leaves nothing behind.
#[derive(Debug)]
pub struct StagedEntry {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    key: CacheKey,
    committed: bool,
}

impl StagedEntry {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Flush and rename into place. If another writer got there first the
    /// staged copy is discarded.
    pub fn commit(mut self) -> Result<PathBuf> {
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(PrecisError::io(&self.temp_path))?;
        }

        if !self.final_path.is_file() {
            fs::rename(&self.temp_path, &self.final_path)
                .map_err(PrecisError::io(&self.final_path))?;
            self.committed = true;
        }

        debug!(
            service = services::CACHE_STORE,
            operation = operations::PUT,
            key = %self.key,
            path = %self.final_path.display(),
            "stored entry"
        );
        Ok(self.final_path.clone())
    }
}

impl Write for StagedEntry {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "staged entry already committed",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StagedEntry {
    fn drop(&mut self) {
        self.file.take();
        if !self.committed {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// Temp name next to the destination so the final rename stays on one filesystem.
/// PID + thread ID avoid collisions between concurrent writers.
fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_name = format!(
        "{}.tmp.{}.{:?}",
        file_name,
        std::process::id(),
        thread::current().id()
    );
    path.with_file_name(temp_name)
}
