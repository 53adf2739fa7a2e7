//! Atomic file writes and JSON load/save.
//!
//! Every durable file the core owns (cache entries, run manifests, metrics
//! snapshots) goes through [`atomic_write`]: the bytes land in a uniquely named
//! sibling first and are renamed over the target, so a crash never leaves a
//! partially written file behind. The predictions log is the one exception; it
//! is append-only JSONL written by [`crate::artifact::ShardWriter`].

use std::io;
use std::path::{Path, PathBuf};

/// Atomically write JSON data to a file.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
///
/// The temporary name carries a random suffix so concurrent writers of the same
/// target never clobber each other's partial output; the last rename wins.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(path);
    if let Err(e) = std::fs::write(&tmp, data).and_then(|_| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}
