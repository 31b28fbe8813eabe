//! Parsing of `git worktree list --porcelain`
//!
//! Each worktree is a block of attribute lines starting with `worktree <path>`.
//! These functions are pure so they can be tested on captured output.

use std::path::PathBuf;

/// One worktree as reported by git
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name; `None` for detached or bare worktrees
    pub branch: Option<String>,
    pub locked: bool,
    pub prunable: bool,
}

/// Parse the full porcelain listing
///
/// # Examples
///
/// ```
/// use prdforge::worktree::parsing::parse_worktree_list;
///
/// let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n";
/// let entries = parse_worktree_list(output);
/// assert_eq!(entries[0].branch.as_deref(), Some("main"));
/// ```
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    split_into_blocks(output)
        .into_iter()
        .filter_map(parse_block)
        .collect()
}

/// Branches currently checked out in any worktree
pub fn checked_out_branches(output: &str) -> Vec<String> {
    parse_worktree_list(output)
        .into_iter()
        .filter_map(|entry| entry.branch)
        .collect()
}

fn split_into_blocks(output: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();

    for line in output.lines() {
        if line.starts_with("worktree ") && !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        if !line.is_empty() {
            current.push(line);
        }
    }

    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn parse_block(block: Vec<&str>) -> Option<WorktreeEntry> {
    let path = block
        .iter()
        .find_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)?;

    let mut entry = WorktreeEntry {
        path,
        head: None,
        branch: None,
        locked: false,
        prunable: false,
    };

    for line in &block {
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(short.to_string());
        } else if *line == "locked" || line.starts_with("locked ") {
            entry.locked = true;
        } else if *line == "prunable" || line.starts_with("prunable ") {
            entry.prunable = true;
        }
    }

    Some(entry)
}
