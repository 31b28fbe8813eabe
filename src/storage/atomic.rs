//! Atomic file replacement (write to a temp sibling, then rename)

use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{IoResultExt, Result};

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()))
}

/// Replace `path` with `contents` so readers see either the old or the new file
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.with_path(parent)?;
    }

    let temp_path = temp_sibling(path);
    let result = async {
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_path(&temp_path)?;
        tokio::io::AsyncWriteExt::write_all(&mut file, contents)
            .await
            .with_path(&temp_path)?;
        file.sync_all().await.with_path(&temp_path)?;
        tokio::fs::rename(&temp_path, path).await.with_path(path)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result
}

/// Serialize `value` as pretty JSON and write it atomically
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json).await
}

/// Blocking counterpart of [`write_json_atomic`] for `Drop` paths
pub fn write_json_atomic_blocking<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }

    let json = serde_json::to_vec_pretty(value)?;
    let temp_path = temp_sibling(path);
    let result = (|| {
        let mut file = std::fs::File::create(&temp_path).with_path(&temp_path)?;
        file.write_all(&json).with_path(&temp_path)?;
        file.sync_all().with_path(&temp_path)?;
        std::fs::rename(&temp_path, path).with_path(path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}
