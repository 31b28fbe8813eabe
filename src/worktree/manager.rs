use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::naming::{resolve_branch_name, worktree_dir_name};
use super::parsing::{checked_out_branches, parse_worktree_list, WorktreeEntry};
use crate::error::{CoordinatorError, IoResultExt, Result};
use crate::subprocess::{ProcessCommandBuilder, ProcessOutput, SubprocessManager};

/// What a unit needs from its worktree
#[derive(Debug, Clone)]
pub struct WorktreeRequest {
    pub desired_branch: String,
    pub base_branch: String,
    /// PRD copied into the worktree root
    pub prd_source: PathBuf,
    /// Branches claimed by other units that git does not report yet
    pub reserved_branches: Vec<String>,
}

/// A prepared worktree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub unit_id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Creates and removes one git worktree per unit under `base_dir`
pub struct WorktreeManager {
    repo_path: PathBuf,
    base_dir: PathBuf,
    prd_file_name: String,
    delete_branch_on_cleanup: bool,
    subprocess: SubprocessManager,
}

impl WorktreeManager {
    /// Create a manager for the repository at `repo_path`
    ///
    /// # Errors
    /// Returns error if the base directory cannot be created or either path
    /// cannot be canonicalized.
    pub fn new(
        repo_path: &Path,
        base_dir: &Path,
        subprocess: SubprocessManager,
    ) -> Result<Self> {
        std::fs::create_dir_all(base_dir).with_path(base_dir)?;

        // git reports canonical paths (e.g. /private/var vs /var on macOS)
        let base_dir = base_dir.canonicalize().with_path(base_dir)?;
        let repo_path = repo_path.canonicalize().with_path(repo_path)?;

        Ok(Self {
            repo_path,
            base_dir,
            prd_file_name: "prd.json".to_string(),
            delete_branch_on_cleanup: false,
            subprocess,
        })
    }

    pub fn with_prd_file_name(mut self, name: impl Into<String>) -> Self {
        self.prd_file_name = name.into();
        self
    }

    pub fn with_branch_cleanup(mut self, delete_branch: bool) -> Self {
        self.delete_branch_on_cleanup = delete_branch;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn worktree_path(&self, unit_id: &str) -> PathBuf {
        self.base_dir.join(worktree_dir_name(unit_id))
    }

    /// PRD location inside a unit's worktree
    pub fn prd_path(&self, worktree_path: &Path) -> PathBuf {
        worktree_path.join(&self.prd_file_name)
    }

    pub async fn list(&self) -> Result<Vec<WorktreeEntry>> {
        let output = self.git("worktree list", &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output.stdout))
    }

    /// The worktree registered with git for `unit_id`, if any
    pub async fn find(&self, unit_id: &str) -> Result<Option<WorktreeEntry>> {
        let path = self.worktree_path(unit_id);
        Ok(self.list().await?.into_iter().find(|entry| same_path(&entry.path, &path)))
    }

    /// Create the worktree for `unit_id` on a free branch and copy the PRD into it
    ///
    /// # Errors
    /// Any failing git command yields `WorktreeError` carrying git's output.
    pub async fn create(&self, unit_id: &str, request: &WorktreeRequest) -> Result<Worktree> {
        let path = self.worktree_path(unit_id);
        if path.exists() {
            return Err(CoordinatorError::worktree(
                "worktree add",
                format!("{} already exists", path.display()),
            ));
        }

        let listing = self.git("worktree list", &["worktree", "list", "--porcelain"]).await?;
        let mut taken = checked_out_branches(&listing.stdout);
        taken.extend(request.reserved_branches.iter().cloned());
        let branch = resolve_branch_name(&request.desired_branch, &taken);
        if branch != request.desired_branch {
            info!(
                "Branch {} is checked out elsewhere; unit {} uses {}",
                request.desired_branch, unit_id, branch
            );
        }

        let path_arg = path.to_string_lossy().to_string();
        if self.branch_exists(&branch).await? {
            debug!("Reusing existing branch {}", branch);
            self.git("worktree add", &["worktree", "add", &path_arg, &branch])
                .await?;
        } else {
            self.git(
                "worktree add",
                &[
                    "worktree",
                    "add",
                    "-b",
                    &branch,
                    &path_arg,
                    &request.base_branch,
                ],
            )
            .await?;
        }

        let worktree = Worktree {
            unit_id: unit_id.to_string(),
            path,
            branch,
        };

        if let Err(e) = self.copy_prd(&request.prd_source, &worktree.path).await {
            warn!("Rolling back worktree for {} after PRD copy failed", unit_id);
            if let Err(cleanup) = self.remove_path(&worktree.path, None).await {
                warn!("Rollback failed: {}", cleanup);
            }
            return Err(e);
        }

        info!(
            "Created worktree {} on branch {}",
            worktree.path.display(),
            worktree.branch
        );
        Ok(worktree)
    }

    /// Remove the worktree for `unit_id`; removing an absent worktree is a no-op
    pub async fn remove(&self, unit_id: &str) -> Result<()> {
        let path = self.worktree_path(unit_id);
        let entry = self.find(unit_id).await?;

        match entry {
            Some(entry) => {
                let branch = if self.delete_branch_on_cleanup {
                    entry.branch.clone()
                } else {
                    None
                };
                self.remove_path(&entry.path, branch.as_deref()).await
            }
            None if path.exists() => {
                // Directory left behind without git metadata
                warn!("Removing unregistered worktree directory {}", path.display());
                tokio::fs::remove_dir_all(&path).await.with_path(&path)?;
                self.git("worktree prune", &["worktree", "prune"]).await?;
                Ok(())
            }
            None => {
                debug!("No worktree for unit {}", unit_id);
                Ok(())
            }
        }
    }

    async fn remove_path(&self, path: &Path, delete_branch: Option<&str>) -> Result<()> {
        let path_arg = path.to_string_lossy().to_string();
        self.git(
            "worktree remove",
            &["worktree", "remove", "--force", &path_arg],
        )
        .await?;

        if let Some(branch) = delete_branch {
            self.git("branch delete", &["branch", "-D", branch]).await?;
            info!("Deleted branch {}", branch);
        }

        info!("Removed worktree {}", path.display());
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let command = ProcessCommandBuilder::git(&self.repo_path)
            .args(["rev-parse", "--verify", "--quiet", &reference])
            .build();

        let output = self
            .subprocess
            .runner()
            .run(command)
            .await
            .map_err(|e| CoordinatorError::worktree("rev-parse", e.to_string()))?;
        Ok(output.status.success())
    }

    async fn copy_prd(&self, source: &Path, worktree_path: &Path) -> Result<()> {
        let target = self.prd_path(worktree_path);
        tokio::fs::copy(source, &target)
            .await
            .map_err(|e| {
                CoordinatorError::worktree(
                    "copy PRD",
                    format!("{} -> {}: {e}", source.display(), target.display()),
                )
            })?;
        Ok(())
    }

    /// Run git in the main repository; non-zero exit becomes `WorktreeError`
    async fn git(&self, operation: &str, args: &[&str]) -> Result<ProcessOutput> {
        let command = ProcessCommandBuilder::git(&self.repo_path)
            .args(args.iter().copied())
            .build();

        let output = self
            .subprocess
            .runner()
            .run(command)
            .await
            .map_err(|e| CoordinatorError::worktree(operation, e.to_string()))?;

        if !output.status.success() {
            return Err(CoordinatorError::worktree(operation, output.diagnostics()));
        }
        Ok(output)
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    a == b
        || match (a.canonicalize(), b.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
}
