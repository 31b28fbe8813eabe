//! Worker supervision
//!
//! The supervisor launches one worker process per active unit, tracks its
//! liveness through heartbeat files and exit status, and stops it on
//! request. The worker side of the protocol (heartbeats, checkpoints, the
//! agent loop, the outcome signal) lives in [`worker`].

pub mod heartbeat;
pub mod outcome;
pub mod process;
pub mod state;
pub mod worker;

pub use heartbeat::{is_stale, Heartbeat, HeartbeatWriter};
pub use outcome::{OutcomeStatus, WorkerOutcome};
pub use process::{is_alive, StopOutcome};
pub use state::{InvalidTransition, WorkerEvent, WorkerState};

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use self::heartbeat::read_heartbeat;
use self::process::ProcessState;
use crate::registry::UnitRecord;
use crate::storage::StateLayout;

/// What the coordinator learns about a unit on one poll
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Launched, first heartbeat not seen yet
    Starting,
    Running(Heartbeat),
    /// The worker reported an outcome
    Exited(WorkerOutcome),
    /// Gone or silent without reporting an outcome
    Crashed(String),
}

pub struct WorkerSupervisor {
    layout: StateLayout,
    worker_program: PathBuf,
    heartbeat_interval: Duration,
    grace_period: Duration,
    children: Mutex<HashMap<String, tokio::process::Child>>,
}

impl WorkerSupervisor {
    pub fn new(
        layout: StateLayout,
        worker_program: PathBuf,
        heartbeat_interval: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            layout,
            worker_program,
            heartbeat_interval,
            grace_period,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Poll a unit's worker
    pub async fn observe(&self, record: &UnitRecord) -> Observation {
        let result_path = self.layout.result_file(&record.id);
        if let Some(outcome) = WorkerOutcome::read(&result_path).await {
            if let Some(pid) = record.worker_pid {
                // Reap so the exited worker does not linger as a zombie
                let _ = self.process_state(&record.id, pid);
            }
            return Observation::Exited(outcome);
        }

        let Some(pid) = record.worker_pid else {
            return Observation::Crashed("no worker process recorded".to_string());
        };

        let gone = match self.process_state(&record.id, pid) {
            ProcessState::Alive => None,
            ProcessState::Exited(Some(code)) => {
                Some(format!("worker exited with code {code} without reporting an outcome"))
            }
            ProcessState::Exited(None) => {
                Some("worker was killed by a signal".to_string())
            }
            ProcessState::Gone => Some(format!("worker process {pid} is gone")),
        };
        if let Some(reason) = gone {
            // The outcome may have landed between the two checks
            if let Some(outcome) = WorkerOutcome::read(&result_path).await {
                return Observation::Exited(outcome);
            }
            self.forget(&record.id);
            return Observation::Crashed(reason);
        }

        let now = Utc::now();
        let heartbeat = read_heartbeat(&self.layout.heartbeat_file(&record.id))
            .await
            .filter(|heartbeat| heartbeat.pid == pid);

        match heartbeat {
            Some(heartbeat) if is_stale(now, heartbeat.last_activity, self.heartbeat_interval) => {
                Observation::Crashed(format!(
                    "no heartbeat since {}",
                    heartbeat.last_activity.to_rfc3339()
                ))
            }
            Some(heartbeat) => Observation::Running(heartbeat),
            None => {
                let launched = record.launched_at.or(record.started_at).unwrap_or(now);
                if is_stale(now, launched, self.heartbeat_interval) {
                    Observation::Crashed("no heartbeat since launch".to_string())
                } else {
                    Observation::Starting
                }
            }
        }
    }

    fn children(&self) -> MutexGuard<'_, HashMap<String, tokio::process::Child>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
