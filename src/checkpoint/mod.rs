//! Durable worker progress
//!
//! Each run keeps its checkpoints in its own directory as
//! `cp-<sequence>-<iteration>.json`. Writes are atomic and only the most
//! recent `retention` files survive a save.

mod manager;
mod types;


pub use manager::{select_for_deletion, CheckpointManager};
pub use types::{CheckpointData, CheckpointFile, Phase, StoredCheckpoint, CHECKPOINT_VERSION};
