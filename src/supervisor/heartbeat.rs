//! Worker heartbeats
//!
//! The worker rewrites `heartbeats/<id>.json` every interval from a background
//! task; the coordinator declares a worker crashed once the last write is
//! more than twice the interval old.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CoordinatorError, Result};
use crate::storage::write_json_atomic;

/// Staleness threshold as a multiple of the heartbeat interval
pub const STALE_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub unit_id: String,
    pub pid: u32,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub current_task: Option<String>,
}

/// Whether a heartbeat at `last` is stale at `now`
pub fn is_stale(now: DateTime<Utc>, last: DateTime<Utc>, interval: Duration) -> bool {
    let threshold = interval * STALE_MULTIPLIER;
    match (now - last).to_std() {
        Ok(elapsed) => elapsed > threshold,
        // Heartbeat from the future (clock skew) is fresh
        Err(_) => false,
    }
}

/// Read a heartbeat file; missing or unreadable files read as `None`
pub async fn read_heartbeat(path: &Path) -> Option<Heartbeat> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(heartbeat) => Some(heartbeat),
        Err(e) => {
            warn!("Ignoring unreadable heartbeat {}: {}", path.display(), e);
            None
        }
    }
}

pub async fn clear_heartbeat(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoordinatorError::io(path, e)),
    }
}

/// Background task that keeps a worker's heartbeat fresh
pub struct HeartbeatWriter {
    path: PathBuf,
    state: Arc<Mutex<Heartbeat>>,
    task: JoinHandle<()>,
}

impl HeartbeatWriter {
    /// Write the first heartbeat immediately, then every `interval`
    pub async fn start(path: PathBuf, unit_id: &str, interval: Duration) -> Result<Self> {
        let heartbeat = Heartbeat {
            unit_id: unit_id.to_string(),
            pid: std::process::id(),
            last_activity: Utc::now(),
            iteration: 0,
            current_task: None,
        };
        write_json_atomic(&path, &heartbeat).await?;

        let state = Arc::new(Mutex::new(heartbeat));
        let task_state = Arc::clone(&state);
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = {
                    let mut heartbeat = task_state.lock().await;
                    heartbeat.last_activity = Utc::now();
                    heartbeat.clone()
                };
                if let Err(e) = write_json_atomic(&task_path, &snapshot).await {
                    warn!("Failed to write heartbeat: {}", e);
                }
            }
        });

        debug!("Heartbeat started for {} every {:?}", unit_id, interval);
        Ok(Self { path, state, task })
    }

    /// Record progress and write it out now
    pub async fn pulse(&self, iteration: u32, current_task: Option<&str>) -> Result<()> {
        let snapshot = {
            let mut heartbeat = self.state.lock().await;
            heartbeat.iteration = iteration;
            heartbeat.current_task = current_task.map(str::to_string);
            heartbeat.last_activity = Utc::now();
            heartbeat.clone()
        };
        write_json_atomic(&self.path, &snapshot).await
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatWriter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_stale_threshold() {
        let now = Utc::now();
        let interval = Duration::from_secs(30);

        assert!(!is_stale(now, now - chrono::Duration::seconds(30), interval));
        assert!(!is_stale(now, now - chrono::Duration::seconds(60), interval));
        assert!(is_stale(now, now - chrono::Duration::seconds(61), interval));
        assert!(!is_stale(now, now + chrono::Duration::seconds(5), interval));
    }

    #[tokio::test]
    async fn test_writer_refreshes_heartbeat() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("auth.json");

        let writer = HeartbeatWriter::start(path.clone(), "auth", Duration::from_millis(50))
            .await
            .unwrap();
        let first = read_heartbeat(&path).await.unwrap();
        assert_eq!(first.unit_id, "auth");
        assert_eq!(first.pid, std::process::id());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let later = read_heartbeat(&path).await.unwrap();
        assert!(later.last_activity > first.last_activity);

        writer.pulse(3, Some("T-2")).await.unwrap();
        let pulsed = read_heartbeat(&path).await.unwrap();
        assert_eq!(pulsed.iteration, 3);
        assert_eq!(pulsed.current_task.as_deref(), Some("T-2"));

        writer.stop();
    }

    #[tokio::test]
    async fn test_stopped_writer_goes_stale() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("auth.json");
        let interval = Duration::from_millis(40);

        let writer = HeartbeatWriter::start(path.clone(), "auth", interval)
            .await
            .unwrap();
        writer.stop();

        tokio::time::sleep(interval * 4).await;
        let heartbeat = read_heartbeat(&path).await.unwrap();
        assert!(is_stale(Utc::now(), heartbeat.last_activity, interval));
    }

    #[tokio::test]
    async fn test_missing_heartbeat_reads_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(read_heartbeat(&temp_dir.path().join("none.json")).await.is_none());
        clear_heartbeat(&temp_dir.path().join("none.json")).await.unwrap();
    }
}
