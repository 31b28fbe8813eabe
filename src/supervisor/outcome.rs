//! Outcome signal written by a worker right before a clean exit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::error::{CoordinatorError, ErrorKind, Result};
use crate::storage::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub unit_id: String,
    pub status: OutcomeStatus,
    pub message: String,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    pub iterations: u32,
    pub finished_at: DateTime<Utc>,
}

impl WorkerOutcome {
    pub fn completed(unit_id: &str, iterations: u32, message: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            status: OutcomeStatus::Completed,
            message: message.into(),
            error_kind: None,
            iterations,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        unit_id: &str,
        iterations: u32,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            status: OutcomeStatus::Failed,
            message: message.into(),
            error_kind: Some(kind),
            iterations,
            finished_at: Utc::now(),
        }
    }

    /// Process exit code that accompanies this outcome
    pub fn exit_code(&self) -> i32 {
        match self.status {
            OutcomeStatus::Completed => 0,
            OutcomeStatus::Failed => 1,
        }
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self).await
    }

    /// `None` when the worker has not reported yet
    pub async fn read(path: &Path) -> Option<Self> {
        let bytes = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Ignoring unreadable outcome {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn clear(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoordinatorError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_clear() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("results").join("auth.json");

        assert!(WorkerOutcome::read(&path).await.is_none());

        let outcome = WorkerOutcome::failed("auth", 10, ErrorKind::ResourceExhausted, "max iterations");
        outcome.write(&path).await.unwrap();

        let read = WorkerOutcome::read(&path).await.unwrap();
        assert_eq!(read, outcome);
        assert_eq!(read.exit_code(), 1);

        WorkerOutcome::clear(&path).await.unwrap();
        WorkerOutcome::clear(&path).await.unwrap();
        assert!(WorkerOutcome::read(&path).await.is_none());
    }
}
