//! # prdforge
//!
//! Run many autonomous coding agents in parallel, one git worktree per PRD,
//! under a concurrency limit and a shared API token budget, with crash
//! recovery from checkpoints.
//!
//! ## Usage
//!
//! ```bash
//! prdforge submit auth.json
//! prdforge start --max-parallel 3
//! prdforge status
//! prdforge stop auth
//! ```
//!
//! ## Modules
//!
//! - `app` - Process setup for the binary: logging and fatal error handling
//! - `checkpoint` - Durable, integrity-checked worker progress snapshots
//! - `config` - Layered TOML configuration with environment overrides
//! - `coordinator` - The polling loop that admits, supervises and tears down units
//! - `error` - Error taxonomy shared by every component
//! - `limiter` - Admission checks and the shared API token pool
//! - `prd` - PRD document model and structural validation
//! - `registry` - Lock-guarded registry of units and their status
//! - `storage` - State directory layout, advisory locks and atomic writes
//! - `subprocess` - Unified subprocess abstraction layer for testing
//! - `supervisor` - Worker launch, heartbeats, state machine and the worker loop
//! - `worktree` - Git worktree and branch management per unit
pub mod app;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod prd;
pub mod registry;
pub mod storage;
pub mod subprocess;
pub mod supervisor;
pub mod worktree;

pub use coordinator::Coordinator;
pub use error::{CoordinatorError, ErrorKind, Result};
