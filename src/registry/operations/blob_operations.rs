//! Blob operations for registry client
//!
//! Implements registry blob access outside of uploads:
//! - Blob existence checks (HEAD /v2/{name}/blobs/{digest})
//! - Blob download (GET /v2/{name}/blobs/{digest}), streamed
//! - Blob deletion (DELETE /v2/{name}/blobs/{digest})

use crate::digest::DigestUtils;
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::dispatcher::{ApiRequest, ByteStream, Dispatcher};
use crate::registry::operations::blob_upload_operations::DOCKER_CONTENT_DIGEST;
use reqwest::StatusCode;
use reqwest::header::CONTENT_LENGTH;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A blob being downloaded
pub struct BlobDownload {
    pub digest: String,
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

impl std::fmt::Debug for BlobDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobDownload")
            .field("digest", &self.digest)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct BlobOperations {
    dispatcher: Arc<Dispatcher>,
    repo_prefix: String,
    output: Logger,
}

impl BlobOperations {
    pub fn new(dispatcher: Arc<Dispatcher>, repo_prefix: String, output: Logger) -> Self {
        Self {
            dispatcher,
            repo_prefix,
            output,
        }
    }

    fn blob_path(&self, name: &str, digest: &str) -> String {
        format!("v2/{}{}/blobs/{}", self.repo_prefix, name, digest)
    }

    /// Check blob existence with a HEAD request
    pub async fn blob_exists(
        &self,
        name: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let digest = DigestUtils::normalize_digest(digest)?;
        self.output.detail(&format!(
            "Checking blob existence in remote registry: {}",
            DigestUtils::format_digest_short(&digest)
        ));

        let request = ApiRequest::head(self.blob_path(name, &digest));
        match self.dispatcher.dispatch(request, cancel).await {
            Ok(_) => Ok(true),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Download a blob; the body is consumed lazily and no timeout applies
    pub async fn get_blob(
        &self,
        name: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobDownload> {
        let digest = DigestUtils::normalize_digest(digest)?;
        let request = ApiRequest::get(self.blob_path(name, &digest));
        let response = self.dispatcher.dispatch_streamed(request, cancel).await?;

        let content_length = response
            .header(CONTENT_LENGTH.as_str())
            .and_then(|value| value.parse::<u64>().ok());
        let served_digest = response
            .header(DOCKER_CONTENT_DIGEST)
            .filter(|d| !d.is_empty())
            .unwrap_or(digest);

        self.output.detail(&format!(
            "Streaming blob {} ({})",
            DigestUtils::format_digest_short(&served_digest),
            content_length
                .map(|len| self.output.format_size(len))
                .unwrap_or_else(|| "unknown size".to_string())
        ));

        Ok(BlobDownload {
            digest: served_digest,
            content_length,
            stream: response.body,
        })
    }

    pub async fn delete_blob(
        &self,
        name: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let digest = DigestUtils::normalize_digest(digest)?;
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidArgument(
                "repository name cannot be empty".to_string(),
            ));
        }
        let request = ApiRequest::delete(self.blob_path(name, &digest));
        self.dispatcher.dispatch(request, cancel).await?;
        self.output.info(&format!(
            "Deleted blob {} from {}",
            DigestUtils::format_digest_short(&digest),
            name
        ));
        Ok(())
    }
}
