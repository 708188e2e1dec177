//! SHA256 content digests for blobs
//!
//! Blobs are addressed as `sha256:<64 hex chars>`. These helpers compute and validate that
//! form for buffers and readers, so callers can supply the digest a finalize call requires.

use crate::error::{RegistryError, Result};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom};

/// Digest of zero bytes
pub const EMPTY_BLOB_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 hex digest from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Compute full registry digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("sha256:{}", Self::compute_sha256(data))
    }

    /// Hash a reader from its current position to EOF, then rewind to where it started
    pub fn compute_docker_digest_seekable<R: Read + Seek>(source: &mut R) -> Result<String> {
        let start = source.stream_position()?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        source.seek(SeekFrom::Start(start))?;
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    pub fn is_valid_sha256_hex(digest: &str) -> bool {
        digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
    }

    pub fn is_valid_docker_digest(digest: &str) -> bool {
        digest
            .strip_prefix("sha256:")
            .is_some_and(Self::is_valid_sha256_hex)
    }

    /// Normalize to `sha256:<hex>`, accepting a bare hex string
    pub fn normalize_digest(digest: &str) -> Result<String> {
        let digest = digest.trim();
        if Self::is_valid_docker_digest(digest) {
            return Ok(digest.to_ascii_lowercase());
        }
        if Self::is_valid_sha256_hex(digest) {
            return Ok(format!("sha256:{}", digest.to_ascii_lowercase()));
        }
        Err(RegistryError::InvalidArgument(format!(
            "invalid sha256 digest: '{}'",
            digest
        )))
    }

    /// Truncated digest for log lines
    pub fn format_digest_short(digest: &str) -> &str {
        if digest.len() > 23 { &digest[..23] } else { digest }
    }
}
