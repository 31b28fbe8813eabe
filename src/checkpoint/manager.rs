use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::types::{CheckpointData, CheckpointFile, Phase, StoredCheckpoint, CHECKPOINT_VERSION};
use crate::error::{CoordinatorError, IoResultExt, Result};
use crate::storage::write_json_atomic;

/// Checkpoints of one unit's run, keeping the `retention` most recent
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    unit_id: String,
    retention: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, unit_id: impl Into<String>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            unit_id: unit_id.into(),
            retention: retention.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Atomically persist a checkpoint, then prune to the retention limit
    ///
    /// # Errors
    /// Rejects an iteration lower than one already retained for the same story.
    pub async fn save(
        &self,
        story_id: &str,
        iteration: u32,
        phase: Phase,
        state_snapshot: serde_json::Value,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_path(&self.dir)?;

        let existing = self.files().await?;
        if let Some(latest) = self.latest_iteration_for(story_id, &existing).await {
            if iteration < latest {
                return Err(CoordinatorError::checkpoint_corruption(
                    &self.dir,
                    format!(
                        "iteration {iteration} for story {story_id} is older than retained iteration {latest}"
                    ),
                ));
            }
        }

        // File names must sort in save order even if the clock stalls
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let sequence = existing
            .last()
            .map(|newest| now.max(newest.sequence + 1))
            .unwrap_or(now);

        let data = CheckpointData::new(&self.unit_id, story_id, iteration, phase, state_snapshot);
        let path = self.dir.join(CheckpointFile::file_name(sequence, iteration));
        write_json_atomic(&path, &data).await?;
        debug!(
            "Saved checkpoint {} ({} iteration {} {:?})",
            path.display(),
            story_id,
            iteration,
            phase
        );

        self.prune().await?;
        Ok(path)
    }

    /// Load and validate one checkpoint file
    pub async fn restore(&self, path: &Path) -> Result<CheckpointData> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            CoordinatorError::checkpoint_corruption(path, format!("unreadable: {e}"))
        })?;
        validate(path, &bytes)
    }

    /// Valid checkpoints for `story_id`, newest first
    pub async fn list(&self, story_id: &str) -> Result<Vec<StoredCheckpoint>> {
        let mut result = Vec::new();
        for file in self.files().await?.into_iter().rev() {
            match self.restore(&file.path).await {
                Ok(data) if data.story_id == story_id => result.push(StoredCheckpoint {
                    path: file.path,
                    data,
                }),
                Ok(_) => {}
                Err(e) => debug!("Skipping checkpoint: {}", e),
            }
        }
        Ok(result)
    }

    /// Most recent valid checkpoint, falling back to older ones on corruption
    ///
    /// Returns `Ok(None)` when no checkpoint exists and `CheckpointCorruption`
    /// when every retained checkpoint is invalid.
    pub async fn restore_latest(&self) -> Result<Option<StoredCheckpoint>> {
        let files = self.files().await?;
        if files.is_empty() {
            return Ok(None);
        }

        for file in files.iter().rev() {
            match self.restore(&file.path).await {
                Ok(data) => {
                    info!(
                        "Restoring {} from checkpoint {} (iteration {})",
                        self.unit_id,
                        file.path.display(),
                        data.iteration
                    );
                    return Ok(Some(StoredCheckpoint {
                        path: file.path.clone(),
                        data,
                    }));
                }
                Err(e) => warn!("Skipping corrupt checkpoint: {}", e),
            }
        }

        Err(CoordinatorError::checkpoint_corruption(
            &self.dir,
            format!("none of the {} retained checkpoints is valid", files.len()),
        ))
    }

    /// Remove every checkpoint of this run
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoordinatorError::io(&self.dir, e)),
        }
    }

    async fn prune(&self) -> Result<()> {
        let files = self.files().await?;
        for file in select_for_deletion(&files, self.retention) {
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => debug!("Deleted old checkpoint {}", file.path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CoordinatorError::io(&file.path, e)),
            }
        }
        Ok(())
    }

    /// Checkpoint files, oldest first
    async fn files(&self) -> Result<Vec<CheckpointFile>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoordinatorError::io(&self.dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.with_path(&self.dir)? {
            if let Some(file) = CheckpointFile::parse(entry.path()) {
                files.push(file);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn latest_iteration_for(&self, story_id: &str, files: &[CheckpointFile]) -> Option<u32> {
        let mut latest = None;
        for file in files {
            if let Ok(data) = self.restore(&file.path).await {
                if data.story_id == story_id {
                    latest = latest.max(Some(data.iteration));
                }
            }
        }
        latest
    }
}

/// Oldest files beyond the newest `keep`
pub fn select_for_deletion(files: &[CheckpointFile], keep: usize) -> Vec<CheckpointFile> {
    let mut sorted = files.to_vec();
    sorted.sort();
    let excess = sorted.len().saturating_sub(keep);
    sorted.into_iter().take(excess).collect()
}

fn validate(path: &Path, bytes: &[u8]) -> Result<CheckpointData> {
    let data: CheckpointData = serde_json::from_slice(bytes)
        .map_err(|e| CoordinatorError::checkpoint_corruption(path, format!("unparseable: {e}")))?;

    if data.version != CHECKPOINT_VERSION {
        return Err(CoordinatorError::checkpoint_corruption(
            path,
            format!("unsupported version {}", data.version),
        ));
    }
    if data.unit_id.is_empty() || data.story_id.is_empty() {
        return Err(CoordinatorError::checkpoint_corruption(
            path,
            "missing unit or story id",
        ));
    }
    if !data.verify() {
        return Err(CoordinatorError::checkpoint_corruption(
            path,
            "integrity hash mismatch",
        ));
    }
    Ok(data)
}
