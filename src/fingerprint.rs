//! Content fingerprinting for deduplication.
//!
//! A fingerprint is the lowercase hex SHA-256 digest of the raw evidence
//! bytes. Deterministic; the empty byte sequence fingerprints to the digest
//! of empty input.

use sha2::{Digest, Sha256};

/// Compute the content fingerprint of raw bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
