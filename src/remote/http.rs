use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use super::{RemoteContext, RemoteStorage};
use crate::cancel::CancelFlag;
use crate::error::PrecisError;

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Remote backend speaking plain HTTP object storage
///
/// `PUT {url}/{key}.{ext}` stores an object, `GET` of the same URL fetches it
/// and a 404 is a miss. Works against S3-style presigned prefixes, a WebDAV
/// share or any static file server that accepts uploads.
pub struct HttpRemote {
    base_url: String,
    token_env: Option<String>,
    timeout: Duration,
    token: Option<String>,
    cancel: CancelFlag,
    client: Option<Client>,
    runtime: Option<Runtime>,
    name: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, token_env: Option<String>, timeout_secs: u64) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            name: format!("http:{base_url}"),
            base_url,
            token_env,
            timeout: Duration::from_secs(timeout_secs),
            token: None,
            cancel: CancelFlag::new(),
            client: None,
            runtime: None,
        }
    }

    fn object_url(&self, object: &str) -> String {
        format!("{}/{}", self.base_url, object)
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .context("HTTP remote used before connect()")
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Drive `future` to completion on the backend's runtime, aborting it
    /// once the batch is cancelled
    fn block_on<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let runtime = self
            .runtime
            .as_ref()
            .context("HTTP remote used before connect()")?;
        let cancel = self.cancel.clone();

        runtime.block_on(async move {
            tokio::select! {
                result = future => result,
                _ = async {
                    while !cancel.is_cancelled() {
                        tokio::time::sleep(CANCEL_POLL).await;
                    }
                } => Err(PrecisError::Cancelled.into()),
            }
        })
    }

    async fn put(&self, url: &str, body: Vec<u8>) -> Result<()> {
        debug!("PUT {} ({} bytes)", url, body.len());

        let response = self
            .request(self.client()?.put(url))
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload to {url}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Upload to {} failed: {} - {}", url, status, body);
        }
        Ok(())
    }

    async fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        debug!("GET {}", url);

        let response = self
            .request(self.client()?.get(url))
            .send()
            .await
            .with_context(|| format!("Failed to query {url}"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Download from {} failed: {} - {}", url, status, body);
        }

        let data = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body from {url}"))?;
        Ok(Some(data.to_vec()))
    }
}

impl RemoteStorage for HttpRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, ctx: &RemoteContext) -> Result<()> {
        self.cancel = ctx.cancel.clone();
        if let Some(var) = &self.token_env {
            let token = std::env::var(var)
                .with_context(|| format!("{var} is not set (token for {})", self.base_url))?;
            self.token = Some(token);
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("precis-http")
            .enable_all()
            .build()
            .context("Failed to start HTTP runtime")?;

        info!("HTTP remote ready at {}", self.base_url);
        self.client = Some(client);
        self.runtime = Some(runtime);
        Ok(())
    }

    fn upload(&self, local_path: &Path) -> Result<String> {
        let object = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no file name", local_path.display()))?;
        let url = self.object_url(object);
        let body = std::fs::read(local_path)
            .with_context(|| format!("Failed to read {}", local_path.display()))?;

        self.block_on(self.put(&url, body))?;
        Ok(url)
    }

    fn download(&self, object: &str, dest: &Path) -> Result<bool> {
        let url = self.object_url(object);
        match self.block_on(self.get(&url))? {
            Some(data) => {
                std::fs::write(dest, data)
                    .with_context(|| format!("Failed to write {}", dest.display()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
