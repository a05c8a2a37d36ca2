use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Maps a remote recording file name to its deterministic local path under
/// the configured download root.
pub fn download_path(root: &str, remote_file: &str) -> PathBuf {
    Path::new(root).join(remote_file)
}

pub async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !file_exists(parent).await {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Best-effort removal. A leaked file is a disk-hygiene concern, not a
/// delivery-correctness concern, so the error is logged and swallowed.
pub async fn cleanup_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(_) => debug!("deleted file {}", path.display()),
        Err(e) => warn!("failed to delete file {}: {}", path.display(), e),
    }
}
