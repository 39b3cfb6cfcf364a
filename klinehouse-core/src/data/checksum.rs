//! Integrity verification against the published `.CHECKSUM` sidecar.
//!
//! Sidecar format, one line:
//! ```text
//! d7a8fbb307d7809469ca9abcb0082e4f8d5651e46d3cdb762d02d0bf37c9e592  BTCUSDT-aggTrades-2024-01-01.zip
//! ```

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("invalid checksum file: {0}")]
    InvalidFormat(String),
}

/// Outcome of a passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The archive matched its published checksum.
    Verified { sha256: String },
    /// No checksum was available; the archive is accepted unverified.
    Skipped { sha256: String },
}

impl Verification {
    pub fn sha256(&self) -> &str {
        match self {
            Verification::Verified { sha256 } | Verification::Skipped { sha256 } => sha256,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified { .. })
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Extract the digest from a sidecar. The trailing file name is not checked.
pub fn parse_checksum_file(content: &str) -> Result<String, IntegrityError> {
    let hash = content
        .split_whitespace()
        .next()
        .ok_or_else(|| IntegrityError::InvalidFormat("empty checksum file".into()))?;

    if hash.len() != 64 {
        return Err(IntegrityError::InvalidFormat(format!(
            "digest has {} characters, expected 64",
            hash.len()
        )));
    }
    if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IntegrityError::InvalidFormat(format!(
            "digest is not hex: {hash}"
        )));
    }
    Ok(hash.to_ascii_lowercase())
}

/// Verify archive bytes against optional sidecar bytes.
pub fn verify(archive: &[u8], checksum: Option<&[u8]>) -> Result<Verification, IntegrityError> {
    let actual = compute_sha256(archive);
    let Some(sidecar) = checksum else {
        return Ok(Verification::Skipped { sha256: actual });
    };

    let text = std::str::from_utf8(sidecar)
        .map_err(|_| IntegrityError::InvalidFormat("checksum file is not UTF-8".into()))?;
    let expected = parse_checksum_file(text)?;

    if expected != actual {
        error!(%expected, %actual, "checksum mismatch");
        return Err(IntegrityError::Mismatch { expected, actual });
    }
    debug!(sha256 = %actual, "checksum verified");
    Ok(Verification::Verified { sha256: actual })
}
