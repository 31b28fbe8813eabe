use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{TerminalStatus, UnitError, UnitOutcome, UnitRecord, UnitStatus};
use crate::error::{CoordinatorError, Result};

pub const REGISTRY_VERSION: u32 = 1;

/// Persisted registry state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    pub max_parallel: usize,
    pub api_limit: usize,
    pub active: BTreeMap<String, UnitRecord>,
    /// FIFO admission order
    pub queued: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    #[serde(default)]
    pub stopped: Vec<String>,
    #[serde(default)]
    pub queued_at: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub outcomes: BTreeMap<String, UnitOutcome>,
}

impl RegistryDocument {
    pub fn new(max_parallel: usize, api_limit: usize) -> Self {
        Self {
            version: REGISTRY_VERSION,
            max_parallel,
            api_limit,
            active: BTreeMap::new(),
            queued: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            stopped: Vec::new(),
            queued_at: BTreeMap::new(),
            outcomes: BTreeMap::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.max_parallel
    }

    /// Admit a unit into `active`
    ///
    /// Fails with `ResourceExhausted` when the active set is full.
    pub fn register(&mut self, id: &str, desired_branch: &str) -> Result<UnitRecord> {
        if self.active.contains_key(id) {
            return Err(CoordinatorError::invalid_spec(format!(
                "unit '{id}' is already active"
            )));
        }
        if !self.has_capacity() {
            return Err(CoordinatorError::resource_exhausted(format!(
                "{} of {} parallel slots in use",
                self.active.len(),
                self.max_parallel
            )));
        }

        self.queued.retain(|queued| queued != id);
        let mut record = UnitRecord::new(id, desired_branch);
        record.queued_at = self.queued_at.remove(id);
        record.started_at = Some(Utc::now());
        self.active.insert(id.to_string(), record.clone());
        Ok(record)
    }

    /// Move a unit to a terminal list
    ///
    /// Absent ids are a no-op; a queued id is dropped from the queue.
    pub fn deregister(
        &mut self,
        id: &str,
        status: TerminalStatus,
        error: Option<UnitError>,
    ) -> Option<UnitRecord> {
        let record = self.active.remove(id);
        let was_queued = self.queued.iter().any(|queued| queued == id);
        if record.is_none() && !was_queued {
            return None;
        }

        self.queued.retain(|queued| queued != id);
        self.queued_at.remove(id);

        let list = match status {
            TerminalStatus::Completed => &mut self.completed,
            TerminalStatus::Failed => &mut self.failed,
            TerminalStatus::Stopped => &mut self.stopped,
        };
        if !list.iter().any(|existing| existing == id) {
            list.push(id.to_string());
        }

        let error = error.or_else(|| record.as_ref().and_then(|r| r.last_error.clone()));
        self.outcomes.insert(
            id.to_string(),
            UnitOutcome {
                status: status.into(),
                branch: record
                    .as_ref()
                    .map(|r| r.branch.clone())
                    .unwrap_or_default(),
                error,
                finished_at: Utc::now(),
                restarts: record.as_ref().map(|r| r.restarts).unwrap_or(0),
            },
        );

        record
    }

    /// Append to the FIFO queue; duplicates of queued or active units are rejected
    pub fn enqueue(&mut self, id: &str) -> Result<()> {
        if self.active.contains_key(id) {
            return Err(CoordinatorError::invalid_spec(format!(
                "unit '{id}' is already active"
            )));
        }
        if self.queued.iter().any(|queued| queued == id) {
            return Err(CoordinatorError::invalid_spec(format!(
                "unit '{id}' is already queued"
            )));
        }

        // A resubmitted unit is no longer terminal
        self.completed.retain(|existing| existing != id);
        self.failed.retain(|existing| existing != id);
        self.stopped.retain(|existing| existing != id);

        self.queued.push(id.to_string());
        self.queued_at.insert(id.to_string(), Utc::now());
        Ok(())
    }

    pub fn record_mut(&mut self, id: &str) -> Result<&mut UnitRecord> {
        self.active
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::not_found(format!("active unit '{id}'")))
    }

    /// Status of any known unit, active, queued or finished
    pub fn status_of(&self, id: &str) -> Option<UnitStatus> {
        if let Some(record) = self.active.get(id) {
            return Some(record.status);
        }
        if self.queued.iter().any(|queued| queued == id) {
            return Some(UnitStatus::Queued);
        }
        self.outcomes.get(id).map(|outcome| outcome.status)
    }
}
