//! Worker process control: launch, liveness and graceful stop

use chrono::Utc;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::heartbeat::clear_heartbeat;
use super::outcome::WorkerOutcome;
use super::WorkerSupervisor;
use crate::error::{CoordinatorError, IoResultExt, Result};
use crate::storage::is_process_running;
use crate::subprocess::ProcessError;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited,
    Graceful,
    Forced,
}

/// What is known about a worker process right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessState {
    Alive,
    /// Our child exited with this code (`None` when killed by a signal)
    Exited(Option<i32>),
    /// Not our child and no longer running
    Gone,
}

/// Whether `pid` refers to a live process
pub fn is_alive(pid: u32) -> bool {
    is_process_running(pid)
}

impl WorkerSupervisor {
    /// Start a worker for `unit_id` inside `worktree_path`
    ///
    /// Stale heartbeat and outcome files are removed first so nothing from a
    /// previous attempt is mistaken for this one. Output is appended to
    /// `logs/<id>.log`. The worker leads its own process group so a stop
    /// reaches the agent processes it spawns.
    pub async fn launch(
        &self,
        unit_id: &str,
        worktree_path: &Path,
        resume_from: Option<&Path>,
    ) -> Result<u32> {
        WorkerOutcome::clear(&self.layout.result_file(unit_id)).await?;
        clear_heartbeat(&self.layout.heartbeat_file(unit_id)).await?;

        let log_path = self.layout.log_file(unit_id);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_path(&log_path)?;
        writeln!(
            log,
            "=== {} launching worker for {}{} ===",
            Utc::now().to_rfc3339(),
            unit_id,
            resume_from
                .map(|cp| format!(" (resume from {})", cp.display()))
                .unwrap_or_default()
        )
        .with_path(&log_path)?;
        let stderr_log = log.try_clone().with_path(&log_path)?;

        let mut command = tokio::process::Command::new(&self.worker_program);
        command
            .arg("worker")
            .arg("--state-dir")
            .arg(self.layout.root())
            .arg("--unit")
            .arg(unit_id)
            .arg("--workspace")
            .arg(worktree_path);
        if let Some(checkpoint) = resume_from {
            command.arg("--resume-from").arg(checkpoint);
        }
        command
            .current_dir(worktree_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log));
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ProcessError::SpawnFailed {
            command: self.worker_program.display().to_string(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| {
            CoordinatorError::worker_crashed(unit_id, "worker exited before reporting a pid")
        })?;

        self.children()
            .insert(unit_id.to_string(), child);
        info!(
            "Launched worker for {} (pid {}), logging to {}",
            unit_id,
            pid,
            log_path.display()
        );
        Ok(pid)
    }

    /// Graceful termination: SIGTERM to the group, wait out the grace period, then SIGKILL
    pub async fn stop(&self, unit_id: &str, pid: u32) -> Result<StopOutcome> {
        if self.process_state(unit_id, pid) != ProcessState::Alive {
            self.forget(unit_id);
            return Ok(StopOutcome::AlreadyExited);
        }

        debug!("Sending SIGTERM to worker {} (pid {})", unit_id, pid);
        signal_group(pid, Signal::Terminate)?;

        if self.wait_for_exit(unit_id, pid, self.grace_period).await {
            info!("Worker {} stopped gracefully", unit_id);
            self.forget(unit_id);
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            "Worker {} ignored SIGTERM for {:?}; killing",
            unit_id, self.grace_period
        );
        signal_group(pid, Signal::Kill)?;
        if !self.wait_for_exit(unit_id, pid, KILL_WAIT).await {
            warn!("Worker {} (pid {}) still present after SIGKILL", unit_id, pid);
        }
        self.forget(unit_id);
        Ok(StopOutcome::Forced)
    }

    async fn wait_for_exit(&self, unit_id: &str, pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.process_state(unit_id, pid) != ProcessState::Alive {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Liveness, reaping our own children as a side effect
    pub(crate) fn process_state(&self, unit_id: &str, pid: u32) -> ProcessState {
        let mut children = self.children();
        if let Some(child) = children.get_mut(unit_id) {
            if child.id() == Some(pid) {
                return match child.try_wait() {
                    Ok(Some(status)) => ProcessState::Exited(status.code()),
                    Ok(None) => ProcessState::Alive,
                    Err(e) => {
                        warn!("Failed to poll worker {}: {}", unit_id, e);
                        fallback_state(pid)
                    }
                };
            }
        }
        // Adopted after a coordinator restart, or launched elsewhere
        fallback_state(pid)
    }

    pub(crate) fn forget(&self, unit_id: &str) {
        self.children().remove(unit_id);
    }

    /// Drop handles of workers whose units left `active` behind our back
    ///
    /// Tokio reaps dropped children in the background.
    pub(crate) fn retain_children(&self, active: &HashSet<String>) {
        self.children().retain(|unit_id, _| active.contains(unit_id));
    }
}

fn fallback_state(pid: u32) -> ProcessState {
    if is_alive(pid) {
        ProcessState::Alive
    } else {
        ProcessState::Gone
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal as NixSignal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        Signal::Terminate => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };

    match killpg(Pid::from_raw(pid as i32), nix_signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            message: e.to_string(),
        }
        .into()),
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: Signal) -> Result<()> {
    Err(ProcessError::Signal {
        pid,
        message: "process groups are not supported on this platform".to_string(),
    }
    .into())
}
