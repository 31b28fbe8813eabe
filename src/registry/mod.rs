//! Registry of units of work
//!
//! The registry document is the single source of truth shared by the
//! coordinator, workers and CLI invocations. [`RegistryManager`] serializes
//! every read-modify-write through an advisory file lock; the document type
//! itself only holds pure transitions so they can be tested without I/O.

mod document;
mod manager;

pub use document::{RegistryDocument, REGISTRY_VERSION};
pub use manager::RegistryManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CoordinatorError, ErrorKind};

/// Lifecycle status persisted for each unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Queued,
    Starting,
    Active,
    Completed,
    Failed,
    Stopped,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Completed | UnitStatus::Failed | UnitStatus::Stopped
        )
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnitStatus::Queued => "queued",
            UnitStatus::Starting => "starting",
            UnitStatus::Active => "active",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
            UnitStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Final status accepted by [`RegistryManager::deregister`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Stopped,
}

impl From<TerminalStatus> for UnitStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => UnitStatus::Completed,
            TerminalStatus::Failed => UnitStatus::Failed,
            TerminalStatus::Stopped => UnitStatus::Stopped,
        }
    }
}

/// Last failure recorded against a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl UnitError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl From<&CoordinatorError> for UnitError {
    fn from(error: &CoordinatorError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

/// An admitted unit of work
///
/// A record owns at most one worktree and one worker process at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: String,
    pub status: UnitStatus,
    /// Branch requested by the PRD
    pub requested_branch: String,
    /// Branch actually checked out, possibly suffixed
    pub branch: String,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub worker_pid: Option<u32>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Most recent worker launch, including restarts
    #[serde(default)]
    pub launched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens_held: usize,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub last_error: Option<UnitError>,
}

impl UnitRecord {
    pub fn new(id: impl Into<String>, desired_branch: impl Into<String>) -> Self {
        let branch = desired_branch.into();
        Self {
            id: id.into(),
            status: UnitStatus::Starting,
            requested_branch: branch.clone(),
            branch,
            worktree_path: None,
            worker_pid: None,
            queued_at: None,
            started_at: None,
            launched_at: None,
            tokens_held: 0,
            restarts: 0,
            last_error: None,
        }
    }
}

/// Terminal details kept after a unit leaves `active`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub status: UnitStatus,
    pub branch: String,
    #[serde(default)]
    pub error: Option<UnitError>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub restarts: u32,
}
