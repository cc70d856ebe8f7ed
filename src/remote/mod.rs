pub mod filesystem;
pub mod http;

pub use filesystem::FilesystemRemote;
pub use http::HttpRemote;

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cache_key::CacheKey;
use crate::cancel::CancelFlag;
use crate::config::RemoteConfig;
use crate::error::{PrecisError, Result};
use crate::logging::{operations, services, status};
use crate::storage::{object_name, CacheStore};

/// Batch-level facts a backend may need while initialising
#[derive(Debug, Clone)]
pub struct RemoteContext {
    pub batch_id: String,
    pub cache_dir: PathBuf,
    /// Backends with long transfers abort them once this is set
    pub cancel: CancelFlag,
}

/// A remote storage backend for cache objects
///
/// Objects are addressed by their cache file name (`<key>.<ext>`). The
/// lifecycle is `init` then `connect`, both called once per batch before any
/// transfer.
pub trait RemoteStorage: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Read configuration and credentials
    fn init(&mut self, ctx: &RemoteContext) -> anyhow::Result<()>;

    /// Establish clients/connections
    fn connect(&mut self) -> anyhow::Result<()>;

    /// Upload a cached file, returning its public locator
    fn upload(&self, local_path: &Path) -> anyhow::Result<String>;

    /// Fetch `object` into `dest`. `Ok(false)` means the backend does not have it.
    fn download(&self, object: &str, dest: &Path) -> anyhow::Result<bool>;
}

/// Build a backend from its config entry. Relative paths resolve against `base_dir`.
pub fn from_config(config: &RemoteConfig, base_dir: &Path) -> Box<dyn RemoteStorage> {
    match config {
        RemoteConfig::Filesystem { path } => Box::new(FilesystemRemote::new(base_dir.join(path))),
        RemoteConfig::Http {
            url,
            token_env,
            timeout_secs,
        } => Box::new(HttpRemote::new(url, token_env.clone(), *timeout_secs)),
    }
}

/// Ordered set of backends
///
/// Uploads go to every backend; downloads try backends in registration order
/// and stop at the first hit.
#[derive(Default)]
pub struct RemoteSet {
    backends: Vec<Box<dyn RemoteStorage>>,
    connected: bool,
}

impl RemoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, backend: Box<dyn RemoteStorage>) {
        self.backends.push(backend);
        self.connected = false;
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Run init + connect on every backend. Idempotent per batch.
    pub fn connect_all(&mut self, ctx: &RemoteContext) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        for backend in &mut self.backends {
            let name = backend.name().to_string();
            backend.init(ctx).map_err(|e| {
                PrecisError::Storage(format!("failed to initialise {name}: {e:#}"))
            })?;
            backend
                .connect()
                .map_err(|e| PrecisError::Storage(format!("failed to connect {name}: {e:#}")))?;
            info!(
                service = services::REMOTE,
                operation = operations::CONNECT,
                backend = %name,
                "remote storage connected"
            );
        }
        self.connected = true;
        Ok(())
    }

    /// Upload to every backend, collecting locators.
    ///
    /// A failing backend is logged and skipped; the upload only fails when
    /// backends are configured and none of them accepted the file.
    pub fn broadcast(&self, local_path: &Path) -> Result<Vec<String>> {
        let mut locators = Vec::new();
        let mut failures = Vec::new();

        for backend in &self.backends {
            match backend.upload(local_path) {
                Ok(locator) => {
                    debug!(
                        service = services::REMOTE,
                        operation = operations::UPLOAD,
                        status = status::SUCCESS,
                        backend = backend.name(),
                        locator = %locator,
                        "uploaded"
                    );
                    locators.push(locator);
                }
                Err(e) if is_cancelled(&e) => return Err(PrecisError::Cancelled),
                Err(e) => {
                    warn!(
                        service = services::REMOTE,
                        operation = operations::UPLOAD,
                        status = status::ERROR,
                        backend = backend.name(),
                        path = %local_path.display(),
                        "upload failed: {e:#}"
                    );
                    failures.push(format!("{}: {e:#}", backend.name()));
                }
            }
        }

        if !self.backends.is_empty() && locators.is_empty() {
            return Err(PrecisError::Storage(format!(
                "no backend accepted {}: {}",
                local_path.display(),
                failures.join("; ")
            )));
        }

        Ok(locators)
    }

    /// Materialise `key.ext` in the local store from the first backend that has it.
    pub fn fetch(&self, store: &CacheStore, key: &CacheKey, ext: &str) -> Result<PathBuf> {
        let object = object_name(key, ext);

        for backend in &self.backends {
            // Backends write to the staged temp path; it is renamed into place only on a hit
            let staged = store.stage(key, ext)?;
            match backend.download(&object, staged.temp_path()) {
                Ok(true) => {
                    let path = staged.commit()?;
                    debug!(
                        service = services::REMOTE,
                        operation = operations::DOWNLOAD,
                        status = status::HIT,
                        backend = backend.name(),
                        object = %object,
                        "downloaded"
                    );
                    return Ok(path);
                }
                Ok(false) => {
                    debug!(
                        service = services::REMOTE,
                        operation = operations::DOWNLOAD,
                        status = status::MISS,
                        backend = backend.name(),
                        object = %object,
                        "not found"
                    );
                }
                Err(e) if is_cancelled(&e) => return Err(PrecisError::Cancelled),
                Err(e) => {
                    warn!(
                        service = services::REMOTE,
                        operation = operations::DOWNLOAD,
                        status = status::ERROR,
                        backend = backend.name(),
                        object = %object,
                        "download failed, trying next backend: {e:#}"
                    );
                }
            }
        }

        Err(PrecisError::CacheMiss { object })
    }

    /// Like [`RemoteSet::fetch`] but a miss on every backend is `Ok(false)`
    pub fn try_fetch(&self, store: &CacheStore, key: &CacheKey, ext: &str) -> Result<bool> {
        if self.backends.is_empty() {
            return Ok(false);
        }
        match self.fetch(store, key, ext) {
            Ok(_) => Ok(true),
            Err(PrecisError::CacheMiss { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<PrecisError>(), Some(PrecisError::Cancelled))
}

/// Copy `source` to `dest` through a temp file in the destination directory
pub(crate) fn copy_atomic(source: &Path, dest: &Path) -> std::io::Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let temp = tempfile::NamedTempFile::new_in(parent)?;
    fs::copy(source, temp.path())?;
    temp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::template_text_key;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Backend that always fails, for fall-through behaviour
    struct BrokenRemote {
        attempts: Arc<AtomicUsize>,
    }

    impl RemoteStorage for BrokenRemote {
        fn name(&self) -> &str {
            "broken"
        }
        fn init(&mut self, _ctx: &RemoteContext) -> anyhow::Result<()> {
            Ok(())
        }
        fn connect(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn upload(&self, _local_path: &Path) -> anyhow::Result<String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("bucket unavailable")
        }
        fn download(&self, _object: &str, _dest: &Path) -> anyhow::Result<bool> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("bucket unavailable")
        }
    }

    fn context(temp: &TempDir) -> RemoteContext {
        RemoteContext {
            batch_id: "test".to_string(),
            cache_dir: temp.path().join("cache"),
            cancel: CancelFlag::new(),
        }
    }

    #[test]
    fn test_broadcast_tolerates_one_failing_backend() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache")).unwrap();
        let key = template_text_key("doc");
        let path = store.write(&key, "txt", b"content").unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let mut remotes = RemoteSet::new();
        remotes.push(Box::new(BrokenRemote {
            attempts: attempts.clone(),
        }));
        remotes.push(Box::new(FilesystemRemote::new(temp.path().join("bucket"))));
        remotes.connect_all(&context(&temp)).unwrap();

        let locators = remotes.broadcast(&path).unwrap();
        assert_eq!(locators.len(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_fails_when_every_backend_fails() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache")).unwrap();
        let path = store.write(&template_text_key("doc"), "txt", b"x").unwrap();

        let mut remotes = RemoteSet::new();
        remotes.push(Box::new(BrokenRemote {
            attempts: Arc::new(AtomicUsize::new(0)),
        }));
        remotes.connect_all(&context(&temp)).unwrap();

        assert!(matches!(
            remotes.broadcast(&path),
            Err(PrecisError::Storage(_))
        ));
    }

    #[test]
    fn test_broadcast_without_backends_is_ok() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path()).unwrap();
        let path = store.write(&template_text_key("doc"), "txt", b"x").unwrap();
        assert!(RemoteSet::new().broadcast(&path).unwrap().is_empty());
    }

    #[test]
    fn test_fetch_falls_through_to_next_backend() {
        let temp = TempDir::new().unwrap();
        let key = template_text_key("shared");

        // Populate the bucket from another machine's cache
        let origin = CacheStore::new(temp.path().join("origin")).unwrap();
        let origin_path = origin.write(&key, "txt", b"from bucket").unwrap();
        let mut bucket = FilesystemRemote::new(temp.path().join("bucket"));
        bucket.init(&context(&temp)).unwrap();
        bucket.connect().unwrap();
        bucket.upload(&origin_path).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let mut remotes = RemoteSet::new();
        remotes.push(Box::new(BrokenRemote {
            attempts: attempts.clone(),
        }));
        remotes.push(Box::new(FilesystemRemote::new(temp.path().join("bucket"))));
        remotes.connect_all(&context(&temp)).unwrap();

        let local = CacheStore::new(temp.path().join("local")).unwrap();
        let path = remotes.fetch(&local, &key, "txt").unwrap();
        assert_eq!(fs::read(path).unwrap(), b"from bucket");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fetch_miss_everywhere() {
        let temp = TempDir::new().unwrap();
        let mut remotes = RemoteSet::new();
        remotes.push(Box::new(FilesystemRemote::new(temp.path().join("bucket"))));
        remotes.connect_all(&context(&temp)).unwrap();

        let local = CacheStore::new(temp.path().join("local")).unwrap();
        let key = template_text_key("absent");
        assert!(matches!(
            remotes.fetch(&local, &key, "txt"),
            Err(PrecisError::CacheMiss { .. })
        ));
        assert!(!remotes.try_fetch(&local, &key, "txt").unwrap());
        assert!(!local.exists(&key, "txt"));
    }
}
