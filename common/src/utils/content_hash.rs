use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::AppError;

const READ_BUFFER_BYTES: usize = 8192;

/// Hex-encoded SHA-256 of the given bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

/// Calculates the SHA-256 content hash of a file.
///
/// The digest depends only on the bytes of the file, never on its name, location or
/// timestamps. The whole file is read to EOF; a read failure at any point is returned as
/// [`AppError::Identity`] rather than a digest over the bytes seen so far.
pub async fn hash_file(path: &Path) -> Result<String, AppError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|err| {
        AppError::Identity(format!("failed to open {} for hashing: {err}", path.display()))
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];

    loop {
        let n = file.read(&mut buffer).await.map_err(|err| {
            AppError::Identity(format!("failed to read {} for hashing: {err}", path.display()))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(buffer.get(..n).unwrap_or_default());
    }

    let digest = hasher.finalize();
    Ok(format!("{digest:x}"))
}

/// Short prefix used in log lines.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
