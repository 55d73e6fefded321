//! Artifact publishing and download resolution.
//!
//! Publishing is best effort. The caller catches [`PublishError`] and falls
//! back to the service-local download reference; it never fails a build.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use brandkit_core::build_job::BuildJob;
use brandkit_core::types::JobId;

use crate::config::{PipelineConfig, StorageConfig};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("No artifact store configured")]
    Disabled,

    #[error("Upload request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Object store rejected upload ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to read artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Remote destination for finished artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload `local` under `key` and return its public URL.
    async fn upload(&self, local: &Path, key: &str) -> Result<String, PublishError>;
}

// ---------------------------------------------------------------------------
// HTTP object store
// ---------------------------------------------------------------------------

/// Object store speaking the Supabase storage REST API.
pub struct HttpObjectStore {
    client: reqwest::Client,
    config: StorageConfig,
}

impl HttpObjectStore {
    pub fn new(config: StorageConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: StorageConfig) -> Self {
        Self { client, config }
    }

    fn upload_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{key}",
            self.config.url, self.config.bucket
        )
    }

    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{key}",
            self.config.url, self.config.bucket
        )
    }
}

/// MIME type for an app package, by extension.
pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("aab") => "application/octet-stream",
        _ => "application/vnd.android.package-archive",
    }
}

#[async_trait]
impl ArtifactStore for HttpObjectStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<String, PublishError> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|source| PublishError::Io {
                path: local.to_path_buf(),
                source,
            })?;

        let response = self
            .client
            .post(self.upload_url(key))
            .bearer_auth(&self.config.key)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type(local))
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(self.public_url(key))
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Where a successful job's artifact can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadHandle {
    Local(PathBuf),
    Remote(String),
}

#[derive(Clone)]
pub struct ArtifactPublisher {
    store: Option<Arc<dyn ArtifactStore>>,
    download_base: String,
}

impl ArtifactPublisher {
    pub fn new(store: Option<Arc<dyn ArtifactStore>>, download_base: impl Into<String>) -> Self {
        Self {
            store,
            download_base: download_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let store = config
            .storage
            .clone()
            .map(|s| Arc::new(HttpObjectStore::new(s)) as Arc<dyn ArtifactStore>);
        Self::new(store, config.download_base.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub async fn publish(&self, local: &Path, key: &str) -> Result<String, PublishError> {
        let store = self.store.as_ref().ok_or(PublishError::Disabled)?;
        store.upload(local, key).await
    }

    /// Service-local reference the API layer streams from.
    pub fn local_reference(&self, job_id: JobId) -> String {
        format!("{}/{job_id}/download", self.download_base)
    }

    /// Prefer a published URL, otherwise the durable local file.
    pub fn resolve_download_handle(job: &BuildJob) -> Option<DownloadHandle> {
        match job.artifact_locator.as_deref() {
            Some(locator) if is_remote_url(locator) => Some(DownloadHandle::Remote(locator.to_string())),
            _ => job
                .artifact_path
                .as_ref()
                .map(|p| DownloadHandle::Local(PathBuf::from(p))),
        }
    }
}

pub fn is_remote_url(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}
