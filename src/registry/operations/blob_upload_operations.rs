//! Resumable blob uploads
//!
//! Implements the registry upload protocol:
//! - Initiate (POST /v2/{name}/blobs/uploads/)
//! - Chunk transfer (PATCH <location>, `Content-Range: begin-end`)
//! - Finalize (PUT <location>?digest=<digest>)
//! - Cancel (DELETE <location>)
//! - Monolithic upload (POST /v2/{name}/blobs/uploads/?digest=<digest>, finalized with a
//!   single PUT when the registry opens a session instead)
//! - Cross-repository mount and upload status
//!
//! Any failure after a session exists cancels that session before the error is returned.

use crate::digest::DigestUtils;
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::dispatcher::{ApiRequest, ApiResponse, Dispatcher};
use crate::registry::query::{QueryString, location_path};
use crate::upload::{
    ChunkPlanner, ChunkRange, CompletedUpload, UploadSession, UploadState, UploadStatus,
};
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, HeaderValue};
use std::io::{Read, Seek};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DOCKER_UPLOAD_UUID: &str = "Docker-Upload-UUID";
pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const OCTET_STREAM: &str = "application/octet-stream";

/// Outcome of a cross-repository mount request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountResult {
    pub status: StatusCode,
    pub location: Option<String>,
    pub digest: Option<String>,
    pub upload_id: Option<String>,
    pub range: Option<String>,
}

impl MountResult {
    /// 201: the blob now exists in the target repository
    pub fn is_mounted(&self) -> bool {
        self.status == StatusCode::CREATED
    }

    /// 202: the registry opened an upload session instead of mounting
    pub fn fallback_session(&self, name: &str) -> Option<UploadSession> {
        if self.status != StatusCode::ACCEPTED {
            return None;
        }
        let location = self.location.clone().unwrap_or_default();
        let upload_id = self
            .upload_id
            .clone()
            .or_else(|| upload_id_from_location(&location))?;
        Some(UploadSession::new(name, upload_id, location))
    }
}

#[derive(Clone)]
pub struct BlobUploadOperations {
    dispatcher: Arc<Dispatcher>,
    repo_prefix: String,
    chunk_size: u64,
    output: Logger,
}

impl BlobUploadOperations {
    pub fn new(dispatcher: Arc<Dispatcher>, repo_prefix: String, chunk_size: u64, output: Logger) -> Self {
        Self {
            dispatcher,
            repo_prefix,
            chunk_size,
            output,
        }
    }

    fn uploads_path(&self, name: &str) -> String {
        format!("v2/{}{}/blobs/uploads/", self.repo_prefix, name)
    }

    /// Path and carried query for the session's current location
    fn session_target(&self, session: &UploadSession) -> (String, QueryString) {
        match location_path(&session.location) {
            Some(path) => (path, session.carried_query()),
            None => (
                format!("{}{}", self.uploads_path(&session.name), session.upload_id),
                QueryString::new(),
            ),
        }
    }

    /// Start an upload session
    pub async fn initiate(&self, name: &str, cancel: &CancellationToken) -> Result<UploadSession> {
        require_name(name)?;
        let request = ApiRequest::post(self.uploads_path(name)).with_body(Bytes::new());
        let response = self.dispatcher.dispatch(request, cancel).await?;

        let location = response.header("Location").unwrap_or_default();
        let upload_id = response
            .header(DOCKER_UPLOAD_UUID)
            .filter(|id| !id.is_empty())
            .or_else(|| upload_id_from_location(&location))
            .ok_or_else(|| {
                RegistryError::Parse(
                    "initiate response carried neither Docker-Upload-UUID nor Location".to_string(),
                )
            })?;

        self.output
            .info(&format!("Initiated upload for {} with uuid: {}", name, upload_id));
        self.output.detail(&format!("Using initiate location: {}", location));

        Ok(UploadSession::new(name, upload_id, location))
    }

    /// Send one chunk; returns the successor session.
    ///
    /// On failure the session is cancelled and the original error is returned.
    pub async fn transfer_chunk(
        &self,
        session: UploadSession,
        chunk: &ChunkRange,
        cancel: &CancellationToken,
    ) -> Result<UploadSession> {
        require_live(&session)?;
        match self.send_chunk(&session, chunk, cancel).await {
            Ok(next) => Ok(next),
            Err(e) => {
                let e = classify_chunk_error(e);
                if matches!(e, RegistryError::RangeNotSatisfiable(_)) {
                    self.output.warning(&format!(
                        "Chunk [{}, {}] rejected: out of order or mismatched range; the next chunk must start right after the last acknowledged range{}",
                        chunk.begin,
                        chunk.end,
                        session
                            .range
                            .as_deref()
                            .map(|r| format!(" ({})", r))
                            .unwrap_or_default()
                    ));
                } else {
                    self.output
                        .warning(&format!("Chunk upload failed ({}), cancelling the upload...", e));
                }
                self.abort(&session).await;
                Err(e)
            }
        }
    }

    async fn send_chunk(
        &self,
        session: &UploadSession,
        chunk: &ChunkRange,
        cancel: &CancellationToken,
    ) -> Result<UploadSession> {
        let (path, query) = self.session_target(session);
        let request = ApiRequest::patch(path)
            .with_query(query)
            .with_header(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM))
            .with_header(CONTENT_RANGE, HeaderValue::from_str(&chunk.content_range())?)
            .with_body(chunk.payload.clone());

        let response = self.dispatcher.dispatch(request, cancel).await?;

        let next = session.advance(
            response.header(DOCKER_UPLOAD_UUID).filter(|id| !id.is_empty()),
            response.header("Location").filter(|l| !l.is_empty()),
            response.header("Range"),
        );
        self.output.detail(&format!(
            "Chunk [{}, {}] accepted, uuid: {}, range: {}",
            chunk.begin,
            chunk.end,
            next.upload_id,
            next.range.as_deref().unwrap_or("-")
        ));
        Ok(next)
    }

    /// Finalize with the full-content digest and any trailing bytes.
    ///
    /// On failure the session is cancelled and the original error is returned.
    pub async fn complete(
        &self,
        session: UploadSession,
        digest: &str,
        trailing: Option<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload> {
        require_live(&session)?;
        match self.send_complete(&session, digest, trailing, cancel).await {
            Ok(done) => Ok(done),
            Err(e) => {
                self.output
                    .warning(&format!("Finalize failed ({}), cancelling the upload...", e));
                self.abort(&session).await;
                Err(e)
            }
        }
    }

    async fn send_complete(
        &self,
        session: &UploadSession,
        digest: &str,
        trailing: Option<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload> {
        let digest = DigestUtils::normalize_digest(digest)?;
        let (path, mut query) = self.session_target(session);
        query.add("digest", digest.clone());

        let request = ApiRequest::put(path)
            .with_query(query)
            .with_header(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM))
            .with_body(trailing.unwrap_or_default());
        let response = self.dispatcher.dispatch(request, cancel).await?;

        let completed = completed_upload(
            &response,
            digest,
            Some(session.clone().finish(UploadState::Completed)),
        );
        self.output.success(&format!(
            "Finished upload of {} to {}",
            DigestUtils::format_digest_short(&completed.digest),
            completed.location.as_deref().unwrap_or(&session.location)
        ));
        Ok(completed)
    }

    /// Best-effort delete of the session; never fails.
    ///
    /// Returns the session in its terminal `Cancelled` state.
    pub async fn cancel(&self, session: UploadSession) -> UploadSession {
        if !session.state.is_terminal() {
            self.abort(&session).await;
        }
        session.finish(UploadState::Cancelled)
    }

    async fn abort(&self, session: &UploadSession) {
        let (path, query) = self.session_target(session);
        let request = ApiRequest::delete(path).with_query(query);
        // The caller's token may be the reason we are here
        let detached = CancellationToken::new();

        match self.dispatcher.dispatch(request, &detached).await {
            Ok(_) => self
                .output
                .detail(&format!("Cancelled upload session {}", session.upload_id)),
            Err(e) => self.output.warning(&format!(
                "Cancel of upload session {} did not succeed: {}",
                session.upload_id, e
            )),
        }
    }

    /// Upload content too small to chunk in one transfer.
    ///
    /// The content is POSTed with its digest. A 201 finishes the upload. A registry that
    /// answers 202 opens a session instead; the whole content then goes out in one finalize
    /// PUT, which cancels the session if it fails.
    pub async fn upload_monolithic(
        &self,
        name: &str,
        payload: Bytes,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload> {
        require_name(name)?;
        let digest = DigestUtils::normalize_digest(digest)?;
        self.output.detail(&format!(
            "Monolithic upload of {} ({}) to {}",
            DigestUtils::format_digest_short(&digest),
            self.output.format_size(payload.len() as u64),
            name
        ));

        let request = ApiRequest::post(self.uploads_path(name))
            .with_query(QueryString::new().with("digest", digest.clone()))
            .with_header(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM))
            .with_body(payload.clone());
        let response = self.dispatcher.dispatch(request, cancel).await?;

        if response.status != StatusCode::ACCEPTED {
            return Ok(completed_upload(&response, digest, None));
        }

        let session = opened_session(name, &response).ok_or_else(|| {
            RegistryError::Parse(format!(
                "upload session opened for {} carried neither Docker-Upload-UUID nor Location",
                name
            ))
        })?;
        self.output.detail(&format!(
            "Registry opened session {} for {}, finalizing with the full content",
            session.upload_id, name
        ));
        self.complete(session, &digest, Some(payload), cancel).await
    }

    /// Plan `source` with the configured chunk size and upload it.
    ///
    /// Sources shorter than one chunk, including empty ones, go through
    /// [`upload_monolithic`](Self::upload_monolithic).
    pub async fn upload_blob<R: Read + Seek>(
        &self,
        name: &str,
        source: &mut R,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload> {
        let planner = ChunkPlanner::new(self.chunk_size)?;
        let chunks = planner.plan(source)?;

        if chunks.is_empty() {
            let mut payload = Vec::new();
            source.read_to_end(&mut payload)?;
            return self
                .upload_monolithic(name, Bytes::from(payload), digest, cancel)
                .await;
        }

        let total: u64 = chunks.iter().map(ChunkRange::size).sum();
        self.output.info(&format!(
            "Uploading {} to {} in {} chunks",
            self.output.format_size(total),
            name,
            chunks.len()
        ));
        self.upload_chunks(name, &chunks, digest, cancel).await
    }

    /// Initiate, transfer every chunk in order, then finalize
    pub async fn upload_chunks(
        &self,
        name: &str,
        chunks: &[ChunkRange],
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload> {
        let mut session = self.initiate(name, cancel).await?;
        for chunk in chunks {
            session = self.transfer_chunk(session, chunk, cancel).await?;
        }
        self.complete(session, digest, None, cancel).await
    }

    /// Ask the registry to link an existing blob from another repository
    pub async fn mount_blob(
        &self,
        name: &str,
        digest: &str,
        from: &str,
        cancel: &CancellationToken,
    ) -> Result<MountResult> {
        require_name(name)?;
        require_name(from)?;
        let digest = DigestUtils::normalize_digest(digest)?;

        let request = ApiRequest::post(self.uploads_path(name))
            .with_query(
                QueryString::new()
                    .with("mount", digest.clone())
                    .with("from", from),
            )
            .with_body(Bytes::new());
        let response = self.dispatcher.dispatch(request, cancel).await?;

        let result = MountResult {
            status: response.status,
            location: response.header("Location"),
            digest: response.header(DOCKER_CONTENT_DIGEST),
            upload_id: response.header(DOCKER_UPLOAD_UUID),
            range: response.header("Range"),
        };
        if result.is_mounted() {
            self.output.success(&format!(
                "Mounted {} from {} into {}",
                DigestUtils::format_digest_short(&digest),
                from,
                name
            ));
        } else {
            self.output.detail(&format!(
                "Mount of {} from {} returned {}",
                DigestUtils::format_digest_short(&digest),
                from,
                result.status
            ));
        }
        Ok(result)
    }

    /// Progress of an upload as recorded by the registry
    pub async fn upload_status(
        &self,
        name: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadStatus> {
        require_name(name)?;
        if upload_id.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "upload id cannot be empty".to_string(),
            ));
        }
        let request = ApiRequest::get(format!("{}{}", self.uploads_path(name), upload_id));
        let response = self.dispatcher.dispatch(request, cancel).await?;

        let status = UploadStatus {
            upload_id: response.header(DOCKER_UPLOAD_UUID),
            range: response.header("Range"),
        };
        self.output.detail(&format!(
            "Upload status for {}: uuid={:?}, range={:?}",
            upload_id, status.upload_id, status.range
        ));
        Ok(status)
    }
}

fn require_live(session: &UploadSession) -> Result<()> {
    if session.state.is_terminal() {
        return Err(RegistryError::InvalidArgument(format!(
            "upload session {} is already {}",
            session.upload_id, session.state
        )));
    }
    Ok(())
}

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(RegistryError::InvalidArgument(
            "repository name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// 416 on a chunk means the range was out of order or did not match
fn classify_chunk_error(error: RegistryError) -> RegistryError {
    match error {
        RegistryError::Api(response) if response.status == StatusCode::RANGE_NOT_SATISFIABLE => {
            RegistryError::RangeNotSatisfiable(response)
        }
        other => other,
    }
}

fn completed_upload(
    response: &ApiResponse<String>,
    requested_digest: String,
    session: Option<UploadSession>,
) -> CompletedUpload {
    CompletedUpload {
        digest: response
            .header(DOCKER_CONTENT_DIGEST)
            .filter(|d| !d.is_empty())
            .unwrap_or(requested_digest),
        location: response.header("Location"),
        session,
    }
}

/// Session described by a 202 answer; `None` when it cannot be addressed
fn opened_session(name: &str, response: &ApiResponse<String>) -> Option<UploadSession> {
    let location = response.header("Location").filter(|l| !l.is_empty());
    let upload_id = response
        .header(DOCKER_UPLOAD_UUID)
        .filter(|id| !id.is_empty())
        .or_else(|| location.as_deref().and_then(upload_id_from_location));
    if upload_id.is_none() && location.is_none() {
        return None;
    }
    Some(UploadSession::new(
        name,
        upload_id.unwrap_or_default(),
        location.unwrap_or_default(),
    ))
}

/// Last path segment of an upload location
fn upload_id_from_location(location: &str) -> Option<String> {
    location_path(location)?
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && *segment != "uploads")
        .map(str::to_string)
}
