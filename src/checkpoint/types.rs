use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Version for checkpoint format compatibility
pub const CHECKPOINT_VERSION: u32 = 1;

/// Where in an iteration the worker was when it checkpointed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Worker started, nothing attempted yet
    Setup,
    /// About to invoke the agent for `story_id`
    BeforeAgent,
    /// Agent returned; task state re-read from the PRD
    AfterAgent,
    /// Every task passes
    Completed,
}

/// A persisted snapshot of a worker's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub version: u32,
    pub unit_id: String,
    pub story_id: String,
    pub iteration: u32,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    /// Serialized task-pass state
    pub state: serde_json::Value,
    /// SHA-256 over every other field
    pub integrity_hash: String,
}

/// Hashed view of [`CheckpointData`], field order fixed
#[derive(Serialize)]
struct HashInput<'a> {
    version: u32,
    unit_id: &'a str,
    story_id: &'a str,
    iteration: u32,
    phase: Phase,
    timestamp: &'a DateTime<Utc>,
    state: &'a serde_json::Value,
}

impl CheckpointData {
    pub fn new(
        unit_id: &str,
        story_id: &str,
        iteration: u32,
        phase: Phase,
        state: serde_json::Value,
    ) -> Self {
        let mut data = Self {
            version: CHECKPOINT_VERSION,
            unit_id: unit_id.to_string(),
            story_id: story_id.to_string(),
            iteration,
            phase,
            timestamp: Utc::now(),
            state,
            integrity_hash: String::new(),
        };
        data.integrity_hash = data.compute_hash();
        data
    }

    pub fn compute_hash(&self) -> String {
        let input = HashInput {
            version: self.version,
            unit_id: &self.unit_id,
            story_id: &self.story_id,
            iteration: self.iteration,
            phase: self.phase,
            timestamp: &self.timestamp,
            state: &self.state,
        };
        // Serializing plain structs and a Value cannot fail
        let bytes = serde_json::to_vec(&input).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    pub fn verify(&self) -> bool {
        self.integrity_hash == self.compute_hash()
    }
}

/// A checkpoint file on disk, ordered by its name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckpointFile {
    /// Microseconds since the epoch, strictly increasing per run
    pub sequence: u64,
    pub iteration: u32,
    pub path: PathBuf,
}

impl CheckpointFile {
    pub fn file_name(sequence: u64, iteration: u32) -> String {
        format!("cp-{sequence:020}-{iteration:08}.json")
    }

    /// Parse `cp-<sequence>-<iteration>.json`
    pub fn parse(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_prefix("cp-")?.strip_suffix(".json")?;
        let (sequence, iteration) = stem.split_once('-')?;
        Some(Self {
            sequence: sequence.parse().ok()?,
            iteration: iteration.parse().ok()?,
            path,
        })
    }
}

/// A checkpoint that passed validation, with the file it came from
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheckpoint {
    pub path: PathBuf,
    pub data: CheckpointData,
}
