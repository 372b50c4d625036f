//! Content hashing for dependency files.
//!
//! Digests are lowercase hex SHA-256 over the exact byte content of a file
//! and serve as cache keys on the server.

use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

/// Hash a byte buffer into its hex digest.
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash a file's content into its hex digest.
pub fn digest_file(path: &Path) -> io::Result<String> {
    let content = std::fs::read(path)?;
    Ok(digest_bytes(&content))
}
