//! On-disk layout of the coordinator's state directory
//!
//! All shared state lives under one directory (default `<repo>/.prdforge`):
//!
//! ```text
//! registry.json        registry document (+ .bak, .lock)
//! tokens.json          API token pool (+ .lock)
//! coordinator.toml     effective config snapshot read by workers
//! prds/<id>.json       submitted PRD copies
//! heartbeats/<id>.json worker liveness records
//! results/<id>.json    worker outcome signals
//! logs/<id>.log        captured worker output
//! checkpoints/<id>/    per-run checkpoints
//! ```

pub mod atomic;
pub mod lock;

pub use atomic::{write_atomic, write_json_atomic, write_json_atomic_blocking};
pub use lock::{get_hostname, is_process_running, FileLock, LockMetadata};

use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};

/// Resolves every path inside the state directory
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory skeleton
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.prds_dir(),
            self.heartbeats_dir(),
            self.results_dir(),
            self.logs_dir(),
            self.root.join("checkpoints"),
        ] {
            std::fs::create_dir_all(&dir).with_path(&dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    pub fn registry_lock(&self) -> PathBuf {
        self.root.join("registry.lock")
    }

    pub fn tokens_file(&self) -> PathBuf {
        self.root.join("tokens.json")
    }

    pub fn tokens_lock(&self) -> PathBuf {
        self.root.join("tokens.lock")
    }

    pub fn config_snapshot(&self) -> PathBuf {
        self.root.join("coordinator.toml")
    }

    pub fn prds_dir(&self) -> PathBuf {
        self.root.join("prds")
    }

    pub fn prd_file(&self, unit_id: &str) -> PathBuf {
        self.prds_dir().join(format!("{unit_id}.json"))
    }

    pub fn heartbeats_dir(&self) -> PathBuf {
        self.root.join("heartbeats")
    }

    pub fn heartbeat_file(&self, unit_id: &str) -> PathBuf {
        self.heartbeats_dir().join(format!("{unit_id}.json"))
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn result_file(&self, unit_id: &str) -> PathBuf {
        self.results_dir().join(format!("{unit_id}.json"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_file(&self, unit_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{unit_id}.log"))
    }

    pub fn checkpoints_dir(&self, unit_id: &str) -> PathBuf {
        self.root.join("checkpoints").join(unit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = StateLayout::new("/repo/.prdforge");
        assert_eq!(
            layout.registry_file(),
            PathBuf::from("/repo/.prdforge/registry.json")
        );
        assert_eq!(
            layout.heartbeat_file("auth"),
            PathBuf::from("/repo/.prdforge/heartbeats/auth.json")
        );
        assert_eq!(
            layout.checkpoints_dir("auth"),
            PathBuf::from("/repo/.prdforge/checkpoints/auth")
        );
    }

    #[test]
    fn test_ensure_creates_skeleton() {
        let temp_dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(temp_dir.path().join("state"));
        layout.ensure().unwrap();
        assert!(layout.heartbeats_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
        assert!(layout.prds_dir().is_dir());
    }
}
