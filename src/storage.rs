//! Storage helpers for artifact blobs on disk.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Compute the SHA-256 checksum of a blob.
pub fn blob_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Construct the storage path for an artifact blob.
///
/// Uses a two-level directory structure based on checksum prefix for
/// filesystem efficiency: `{blobs_dir}/{checksum[0..2]}/{checksum}.{extension}`
pub fn blob_storage_path(blobs_dir: &Path, checksum: &str, extension: &str) -> PathBuf {
    blobs_dir
        .join(&checksum[..2])
        .join(format!("{checksum}.{extension}"))
}

/// Write a blob to its content-derived path, creating directories as needed.
///
/// Returns the path and the checksum. Writing the same bytes twice lands on
/// the same path, so the write is idempotent.
pub fn write_blob(blobs_dir: &Path, content: &[u8], extension: &str) -> std::io::Result<(PathBuf, String)> {
    let checksum = blob_checksum(content);
    let path = blob_storage_path(blobs_dir, &checksum, extension);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        std::fs::write(&path, content)?;
    }
    Ok((path, checksum))
}

/// Read a blob back as bytes.
pub fn read_blob(path: &Path) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}

/// Read a text blob back as a string, replacing invalid UTF-8.
pub fn read_text_blob(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}
