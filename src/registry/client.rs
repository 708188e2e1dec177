// Registry client: wires configuration, authentication and the dispatcher together and
// hands out the blob and upload operation groups that share them.

use crate::config::RegistryClientConfig;
use crate::digest::DigestUtils;
use crate::error::handlers::NetworkErrorHandler;
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::auth::AuthStrategy;
use crate::registry::dispatcher::{ApiRequest, Dispatcher};
use crate::registry::operations::{BlobOperations, BlobUploadOperations};
use crate::upload::CompletedUpload;
use bytes::Bytes;
use futures::future::join_all;
use reqwest::Client;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

pub struct RegistryClientBuilder {
    config: RegistryClientConfig,
    endpoint: Option<Url>,
    auth: Option<Arc<dyn AuthStrategy>>,
    output: Option<Logger>,
}

impl RegistryClientBuilder {
    pub fn new(config: RegistryClientConfig) -> Self {
        Self {
            config,
            endpoint: None,
            auth: None,
            output: None,
        }
    }

    /// Skip discovery and talk to `endpoint` directly
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Replace the strategy that `auth_mode` would select
    pub fn with_auth_strategy(mut self, auth: Arc<dyn AuthStrategy>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_logger(mut self, output: Logger) -> Self {
        self.output = Some(output);
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        self.config.validate()?;

        let http = if self.config.skip_tls {
            Client::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            Client::builder().build()
        }
        .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "building HTTP client"))?;

        let output = self
            .output
            .unwrap_or_else(|| Logger::new("registry", self.config.verbose));
        let auth = match self.auth {
            Some(auth) => auth,
            None => self.config.build_auth_strategy(http.clone(), &output)?,
        };

        let mut dispatcher = Dispatcher::new(
            http,
            self.config.host.clone(),
            self.config.timeout(),
            auth,
            output.for_component("dispatcher"),
        );
        if let Some(endpoint) = self.endpoint {
            dispatcher = dispatcher.with_endpoint(endpoint);
        }

        output.verbose(&format!(
            "Registry client for {} ({:?}, chunk size {}, max concurrency {})",
            self.config.host,
            self.config.auth_mode,
            output.format_size(self.config.chunk_size),
            self.config.max_concurrency
        ));

        Ok(RegistryClient {
            config: self.config,
            dispatcher: Arc::new(dispatcher),
            output,
        })
    }
}

/// One entry of a batch upload
#[derive(Debug, Clone)]
pub struct BlobUpload {
    pub name: String,
    pub data: Bytes,
    /// Computed from `data` when absent
    pub digest: Option<String>,
}

impl BlobUpload {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub name: String,
    pub digest: String,
    pub result: Result<CompletedUpload>,
}

pub struct RegistryClient {
    config: RegistryClientConfig,
    dispatcher: Arc<Dispatcher>,
    output: Logger,
}

impl RegistryClient {
    pub fn new(config: RegistryClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: RegistryClientConfig) -> RegistryClientBuilder {
        RegistryClientBuilder::new(config)
    }

    pub fn config(&self) -> &RegistryClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn blobs(&self) -> BlobOperations {
        BlobOperations::new(
            Arc::clone(&self.dispatcher),
            self.config.normalized_repo_prefix(),
            self.output.for_component("blobs"),
        )
    }

    pub fn blob_uploads(&self) -> BlobUploadOperations {
        BlobUploadOperations::new(
            Arc::clone(&self.dispatcher),
            self.config.normalized_repo_prefix(),
            self.config.chunk_size,
            self.output.for_component("uploads"),
        )
    }

    /// Authenticate as someone else from now on
    pub fn change_identity(&self, username: &str, password: &str) {
        self.output
            .info(&format!("Switching registry identity to {}", username));
        self.dispatcher.auth().change_identity(username, password);
    }

    /// Resolve the endpoint and confirm the API root answers
    pub async fn check_registry_version(&self, cancel: &CancellationToken) -> Result<Url> {
        let endpoint = self.dispatcher.endpoint().await?;
        self.dispatcher
            .dispatch(ApiRequest::get("v2/"), cancel)
            .await?;
        self.output
            .success(&format!("Registry API v2 is available at {}", endpoint));
        Ok(endpoint)
    }

    /// Upload independent blobs with at most `max_concurrency` in flight.
    ///
    /// Outcomes are returned in input order; one failure does not stop the others.
    pub async fn upload_blobs(
        &self,
        items: Vec<BlobUpload>,
        cancel: &CancellationToken,
    ) -> Vec<UploadOutcome> {
        let uploads = self.blob_uploads();
        let limit = self.config.max_concurrency.max(1);
        let start_time = Instant::now();
        self.output.info(&format!(
            "Uploading {} blobs with {} concurrent uploads",
            items.len(),
            limit
        ));

        let semaphore = Arc::new(Semaphore::new(limit));
        let upload_futures = items.into_iter().map(|item| {
            let uploads = uploads.clone();
            let semaphore = Arc::clone(&semaphore);
            async move {
                let digest = item
                    .digest
                    .clone()
                    .unwrap_or_else(|| DigestUtils::compute_docker_digest(&item.data));
                let result = match semaphore.acquire().await {
                    Ok(_permit) => {
                        let mut source = Cursor::new(item.data);
                        uploads
                            .upload_blob(&item.name, &mut source, &digest, cancel)
                            .await
                    }
                    Err(_) => Err(RegistryError::Cancelled),
                };
                UploadOutcome {
                    name: item.name,
                    digest,
                    result,
                }
            }
        });

        let outcomes = join_all(upload_futures).await;
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        if failed == 0 {
            self.output.success(&format!(
                "All {} blobs uploaded in {}",
                outcomes.len(),
                self.output.format_duration(start_time.elapsed())
            ));
        } else {
            self.output.warning(&format!(
                "{} of {} blob uploads failed",
                failed,
                outcomes.len()
            ));
        }
        outcomes
    }
}
