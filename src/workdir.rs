//! Per-flow working directories and content hashing.
//!
//! Uploads and executions resolve paths through the same function, which is
//! how staged files become visible to the executor child: its working
//! directory is the resolved path.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Returns `base_dir/<flow_hash_code>/<rel_dir>`, creating all intermediate
/// directories with mode 0755. Idempotent.
pub async fn resolve(base_dir: &Path, flow_hash_code: u32, rel_dir: &str) -> io::Result<PathBuf> {
    let dir = base_dir.join(flow_hash_code.to_string()).join(rel_dir);
    fs::create_dir_all(&dir).await?;
    fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(dir)
}

/// Hex-encoded SHA-256 of a file's content, streamed in 8 KiB chunks.
pub async fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, matching [`file_sha256`] output.
pub fn content_sha256(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
