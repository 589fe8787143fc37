//! Small helpers shared across modules.

use std::borrow::Cow;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Expand a leading `~` to `$HOME`.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Cow::Owned(format!("{home}{}", &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Replace `path` with `bytes` via a temp file in the same directory, so
/// readers see either the old or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let parent = path.parent().unwrap_or(Path::new("."));
    if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("create {}: {e}", parent.display()))?;
    }
    let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map_or_else(|| "file".into(), |n| n.to_string_lossy());
    let temp_path = parent.join(format!(".{file_name}.tmp_{}_{seq}", std::process::id()));

    tokio::fs::write(&temp_path, bytes)
        .await
        .map_err(|e| format!("write {}: {e}", temp_path.display()))?;
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(format!("rename to {}: {e}", path.display()));
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| e.to_string())?;
    write_atomic(path, &bytes).await
}

/// Read a JSON file. A missing file is `Ok(None)`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| format!("parse {}: {e}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(format!("read {}: {e}", path.display())),
    }
}
