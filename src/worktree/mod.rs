//! Per-unit git worktrees
//!
//! Every admitted unit gets its own worktree under the worktree root, on a
//! branch derived from the PRD's requested branch. Branch names already
//! checked out elsewhere are suffixed (`name-1`, `name-2`, ...).

pub mod manager;
pub mod naming;
pub mod parsing;

#[cfg(test)]
mod tests;

pub use manager::{Worktree, WorktreeManager, WorktreeRequest};
pub use naming::resolve_branch_name;
pub use parsing::WorktreeEntry;
