//! Upload session values threaded through the resumable upload state machine
//!
//! An [`UploadSession`] is an immutable value: every successful step returns a new session
//! carrying whatever upload id and location the registry handed back. Completing or
//! cancelling consumes it.

use crate::registry::query::QueryString;
use std::fmt;

/// Lifecycle of one logical upload.
///
/// No session value exists before initiate. `complete` hands back the session as `Completed`
/// inside [`CompletedUpload`]; `cancel` returns it as `Cancelled`. Terminal sessions are
/// rejected by every further step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    Transferring,
    Completed,
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Cancelled)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Initiated => "initiated",
            UploadState::Transferring => "transferring",
            UploadState::Completed => "completed",
            UploadState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Repository name, without the configured prefix
    pub name: String,
    /// `Docker-Upload-UUID` from the latest response
    pub upload_id: String,
    /// `Location` from the latest response, exactly as the registry sent it
    pub location: String,
    pub state: UploadState,
    /// `Range` from the latest response, e.g. `0-1023`
    pub range: Option<String>,
}

impl UploadSession {
    pub fn new(name: impl Into<String>, upload_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            upload_id: upload_id.into(),
            location: location.into(),
            state: UploadState::Initiated,
            range: None,
        }
    }

    /// Successor session after a chunk was accepted
    pub fn advance(&self, upload_id: Option<String>, location: Option<String>, range: Option<String>) -> Self {
        Self {
            name: self.name.clone(),
            upload_id: upload_id.unwrap_or_else(|| self.upload_id.clone()),
            location: location.unwrap_or_else(|| self.location.clone()),
            state: UploadState::Transferring,
            range: range.or_else(|| self.range.clone()),
        }
    }

    /// Same session moved to `state`
    pub fn finish(self, state: UploadState) -> Self {
        Self { state, ..self }
    }

    /// Query parameters the registry embedded in the current location
    pub fn carried_query(&self) -> QueryString {
        QueryString::from_location(&self.location)
    }

    /// Number of bytes the registry has acknowledged, derived from `Range`
    pub fn acknowledged_bytes(&self) -> Option<u64> {
        let range = self.range.as_deref()?;
        let range = range.trim().trim_start_matches("bytes=");
        let (_, end) = range.split_once('-')?;
        end.trim().parse::<u64>().ok().map(|end| end + 1)
    }
}

/// Result of a finalized upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    /// `Docker-Content-Digest` from the registry, falling back to the requested digest
    pub digest: String,
    /// Canonical blob location, when the registry returned one
    pub location: Option<String>,
    /// The finalized session; `None` when the registry accepted the content in one request
    pub session: Option<UploadSession>,
}

/// Progress of an in-flight upload as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub upload_id: Option<String>,
    pub range: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_replaces_rotated_fields() {
        let session = UploadSession::new("library/app", "uuid-1", "/v2/library/app/blobs/uploads/uuid-1");
        let next = session.advance(
            Some("uuid-2".to_string()),
            Some("/v2/library/app/blobs/uploads/uuid-2?_state=abc".to_string()),
            Some("0-3".to_string()),
        );
        assert_eq!(next.upload_id, "uuid-2");
        assert_eq!(next.location, "/v2/library/app/blobs/uploads/uuid-2?_state=abc");
        assert_eq!(next.state, UploadState::Transferring);
        assert_eq!(next.acknowledged_bytes(), Some(4));
        assert_eq!(session.state, UploadState::Initiated);
    }

    #[test]
    fn test_advance_keeps_fields_the_registry_omitted() {
        let session = UploadSession::new("app", "uuid-1", "/v2/app/blobs/uploads/uuid-1");
        let next = session.advance(None, None, None);
        assert_eq!(next.upload_id, "uuid-1");
        assert_eq!(next.location, session.location);
        assert_eq!(next.acknowledged_bytes(), None);
    }

    #[test]
    fn test_finish_reaches_terminal_states() {
        let session = UploadSession::new("app", "uuid-1", "/v2/app/blobs/uploads/uuid-1");
        assert!(!session.state.is_terminal());
        assert!(!session.advance(None, None, None).state.is_terminal());

        let done = session.clone().finish(UploadState::Completed);
        assert_eq!(done.state, UploadState::Completed);
        assert_eq!(done.upload_id, "uuid-1");
        assert!(done.state.is_terminal());
        assert_eq!(session.finish(UploadState::Cancelled).state.to_string(), "cancelled");
    }

    #[test]
    fn test_acknowledged_bytes_parses_range_forms() {
        let mut session = UploadSession::new("app", "u", "/l");
        session.range = Some("bytes=0-99".to_string());
        assert_eq!(session.acknowledged_bytes(), Some(100));
        session.range = Some("garbage".to_string());
        assert_eq!(session.acknowledged_bytes(), None);
    }
}
