//! Worker lifecycle state machine
//!
//! ```text
//! QUEUED -> STARTING -> RUNNING -> {COMPLETED | FAILED | CRASHED | STOPPED} -> DEREGISTERED
//!                          ^                                |
//!                          +-------- restart (bounded) -----+
//! ```
//!
//! Transitions are pure; the coordinator feeds in observed events.

use serde::{Deserialize, Serialize};

use crate::registry::UnitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
    Crashed,
    Stopped,
    Deregistered,
}

/// Something the coordinator observed about a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A slot and a worktree were granted
    Admitted,
    /// Process launched and its first heartbeat arrived
    HeartbeatReceived,
    /// Clean exit with a success signal that the completion check accepted
    ExitedSuccess,
    /// Clean exit with a failure signal, or a rejected success signal
    ExitedFailure,
    /// Heartbeat older than twice the interval, or the process vanished silently
    HeartbeatStale,
    /// A crashed unit is relaunched from its latest checkpoint
    Restart,
    /// Crashed and out of restarts
    RestartsExhausted,
    StopRequested,
    Deregister,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid worker transition {event:?} from {from:?}")]
pub struct InvalidTransition {
    pub from: WorkerState,
    pub event: WorkerEvent,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Failed | WorkerState::Stopped
        )
    }

    /// Apply `event`, rejecting transitions the lifecycle does not allow
    pub fn transition(self, event: WorkerEvent) -> Result<WorkerState, InvalidTransition> {
        use WorkerEvent as E;
        use WorkerState as S;

        let next = match (self, event) {
            (S::Queued, E::Admitted) => S::Starting,
            (S::Starting, E::HeartbeatReceived) => S::Running,
            (S::Running, E::HeartbeatReceived) => S::Running,
            (S::Starting | S::Running, E::ExitedSuccess) => S::Completed,
            (S::Starting | S::Running, E::ExitedFailure) => S::Failed,
            (S::Starting | S::Running, E::HeartbeatStale) => S::Crashed,
            (S::Crashed, E::Restart) => S::Starting,
            (S::Crashed, E::RestartsExhausted) => S::Failed,
            (S::Queued | S::Starting | S::Running | S::Crashed, E::StopRequested) => S::Stopped,
            (S::Completed | S::Failed | S::Stopped, E::Deregister) => S::Deregistered,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Resume the machine from a persisted registry status
    pub fn from_status(status: UnitStatus) -> Self {
        match status {
            UnitStatus::Queued => WorkerState::Queued,
            UnitStatus::Starting => WorkerState::Starting,
            UnitStatus::Active => WorkerState::Running,
            UnitStatus::Completed => WorkerState::Completed,
            UnitStatus::Failed => WorkerState::Failed,
            UnitStatus::Stopped => WorkerState::Stopped,
        }
    }

    /// Registry status for a live state; crashed units stay active while restarting
    pub fn to_status(self) -> Option<UnitStatus> {
        match self {
            WorkerState::Queued => Some(UnitStatus::Queued),
            WorkerState::Starting => Some(UnitStatus::Starting),
            WorkerState::Running | WorkerState::Crashed => Some(UnitStatus::Active),
            WorkerState::Completed => Some(UnitStatus::Completed),
            WorkerState::Failed => Some(UnitStatus::Failed),
            WorkerState::Stopped => Some(UnitStatus::Stopped),
            WorkerState::Deregistered => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = WorkerState::Queued
            .transition(WorkerEvent::Admitted)
            .and_then(|s| s.transition(WorkerEvent::HeartbeatReceived))
            .and_then(|s| s.transition(WorkerEvent::ExitedSuccess))
            .and_then(|s| s.transition(WorkerEvent::Deregister))
            .unwrap();
        assert_eq!(state, WorkerState::Deregistered);
    }

    #[test]
    fn test_crash_restart_then_exhaust() {
        let crashed = WorkerState::Running
            .transition(WorkerEvent::HeartbeatStale)
            .unwrap();
        assert_eq!(crashed, WorkerState::Crashed);
        assert_eq!(
            crashed.transition(WorkerEvent::Restart).unwrap(),
            WorkerState::Starting
        );
        assert_eq!(
            crashed.transition(WorkerEvent::RestartsExhausted).unwrap(),
            WorkerState::Failed
        );
    }

    #[test]
    fn test_failure_signal() {
        assert_eq!(
            WorkerState::Running
                .transition(WorkerEvent::ExitedFailure)
                .unwrap(),
            WorkerState::Failed
        );
    }

    #[test]
    fn test_stop_from_any_live_state() {
        for state in [
            WorkerState::Queued,
            WorkerState::Starting,
            WorkerState::Running,
            WorkerState::Crashed,
        ] {
            assert_eq!(
                state.transition(WorkerEvent::StopRequested).unwrap(),
                WorkerState::Stopped
            );
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let err = WorkerState::Completed
            .transition(WorkerEvent::Restart)
            .unwrap_err();
        assert_eq!(err.from, WorkerState::Completed);

        assert!(WorkerState::Running
            .transition(WorkerEvent::Deregister)
            .is_err());
        assert!(WorkerState::Queued
            .transition(WorkerEvent::HeartbeatReceived)
            .is_err());
        assert!(WorkerState::Deregistered
            .transition(WorkerEvent::StopRequested)
            .is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            WorkerState::from_status(UnitStatus::Active),
            WorkerState::Running
        );
        assert_eq!(WorkerState::Crashed.to_status(), Some(UnitStatus::Active));
        assert_eq!(WorkerState::Deregistered.to_status(), None);
        assert!(WorkerState::Stopped.is_terminal());
        assert!(!WorkerState::Crashed.is_terminal());
    }
}
