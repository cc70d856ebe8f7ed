use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{copy_atomic, RemoteContext, RemoteStorage};

/// Remote backend backed by a directory (NFS mount, synced folder, ...)
///
/// Mirrors the local shard layout: `<root>/<first 2 chars>/<key>.<ext>`.
pub struct FilesystemRemote {
    root: PathBuf,
    name: String,
}

impl FilesystemRemote {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let name = format!("filesystem:{}", root.display());
        Self { root, name }
    }

    fn object_path(&self, object: &str) -> PathBuf {
        let shard: String = object.chars().take(2).collect();
        self.root.join(shard).join(object)
    }
}

impl RemoteStorage for FilesystemRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, _ctx: &RemoteContext) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        // Resolve symlinks once so locators are stable
        self.root = fs::canonicalize(&self.root)
            .with_context(|| format!("Remote directory {} is unreachable", self.root.display()))?;
        Ok(())
    }

    fn upload(&self, local_path: &Path) -> Result<String> {
        let object = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no file name", local_path.display()))?;
        let dest = self.object_path(object);

        if dest.is_file() {
            debug!("{} already present in {}", object, self.root.display());
        } else {
            copy_atomic(local_path, &dest)
                .with_context(|| format!("Failed to copy {} to {}", object, dest.display()))?;
        }

        Ok(format!("file://{}", dest.display()))
    }

    fn download(&self, object: &str, dest: &Path) -> Result<bool> {
        let source = self.object_path(object);
        if !source.is_file() {
            return Ok(false);
        }
        fs::copy(&source, dest)
            .with_context(|| format!("Failed to copy {} from {}", object, self.root.display()))?;
        Ok(true)
    }
}
