//! Checksum utilities for dump file verification
//!
//! Monthly dump files ship with SHA-256 sums in the provider's checksum
//! manifest. The download path hashes bytes as they are written, so a file
//! never has to be re-read just to verify it.

use crate::error::{Result, SpinlogError};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the SHA-256 checksum of a file, hex-encoded
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute the SHA-256 checksum of any readable source, hex-encoded
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file against an expected SHA-256 checksum
///
/// Returns `Ok(())` on match, `ChecksumMismatch` otherwise. Comparison is
/// case-insensitive because manifests are not consistent about hex casing.
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = compute_file_checksum(path)?;
    verify_checksum(expected, &actual)
}

/// Compare an expected and a computed checksum
pub fn verify_checksum(expected: &str, actual: &str) -> Result<()> {
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(SpinlogError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Incremental SHA-256 hasher
///
/// Feed it chunks as they arrive (e.g. while streaming a download to disk)
/// and call [`StreamingChecksum::finalize`] for the hex digest.
#[derive(Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk of bytes to the running hash
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Consume the hasher and return the hex-encoded digest
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
