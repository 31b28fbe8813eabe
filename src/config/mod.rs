//! Coordinator configuration
//!
//! Settings are layered: built-in defaults, then the user-level file from
//! [`ProjectDirs`], then `<repo>/.prdforge/config.toml`, then `PRDFORGE_*`
//! environment variables. CLI flags are applied last by the binary.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{CoordinatorError, IoResultExt, Result};

/// Default state directory, relative to the repository root
pub const DEFAULT_STATE_DIR: &str = ".prdforge";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Shared state directory (registry, tokens, heartbeats, logs, checkpoints)
    pub state_dir: PathBuf,
    pub max_parallel: usize,
    /// Concurrent agent invocations allowed across all workers
    pub api_limit: usize,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub token_timeout: Duration,
    pub max_restarts: u32,
    pub checkpoint_retention: usize,
    pub max_iterations: u32,
    pub base_branch: String,
    pub delete_branch_on_cleanup: bool,
    /// Where worktrees are created; defaults to the user data dir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_root: Option<PathBuf>,
    pub prd_file_name: String,
    /// Agent invocation, split with shell quoting rules.
    /// `{workspace}` and `{task_id}` are substituted per call.
    pub agent_command: String,
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_timeout: Option<Duration>,
    /// Executable launched for workers; defaults to the running binary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            max_parallel: 3,
            api_limit: 2,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            stop_grace_period: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(10),
            token_timeout: Duration::from_secs(300),
            max_restarts: 1,
            checkpoint_retention: 3,
            max_iterations: 10,
            base_branch: "main".to_string(),
            delete_branch_on_cleanup: false,
            worktree_root: None,
            prd_file_name: "prd.json".to_string(),
            agent_command: "claude --print --dangerously-skip-permissions \"Implement task {task_id} from prd.json in {workspace}\"".to_string(),
            agent_timeout: None,
            worker_program: None,
        }
    }
}

impl CoordinatorConfig {
    /// Load the layered configuration for the repository at `repo_root`
    pub fn load(repo_root: &Path) -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(path) = user_config_path().filter(|p| p.exists()) {
            layers.push(path);
        }
        let project_file = repo_root.join(DEFAULT_STATE_DIR).join(CONFIG_FILE_NAME);
        if project_file.exists() {
            layers.push(project_file);
        }

        // Later files override individual keys of earlier ones
        let mut merged = toml::Table::new();
        for path in &layers {
            debug!("Loading config from {}", path.display());
            let contents = std::fs::read_to_string(path).with_path(path)?;
            let table: toml::Table = toml::from_str(&contents)
                .map_err(|e| CoordinatorError::config(format!("{}: {e}", path.display())))?;
            merged.extend(table);
        }

        let mut config = toml::Value::Table(merged)
            .try_into::<Self>()
            .map_err(|e| CoordinatorError::config(e.to_string()))?;
        config.merge_env_vars();
        config.resolve_paths(repo_root)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).with_path(path)?;
        Self::from_toml(&contents)
            .map_err(|e| CoordinatorError::config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| CoordinatorError::config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CoordinatorError::config(e.to_string()))
    }

    /// Apply `PRDFORGE_*` overrides; unparsable values are ignored
    pub fn merge_env_vars(&mut self) {
        self.merge_vars(|key| std::env::var(key).ok());
    }

    fn merge_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("PRDFORGE_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("PRDFORGE_MAX_PARALLEL").and_then(|v| v.parse().ok()) {
            self.max_parallel = value;
        }
        if let Some(value) = lookup("PRDFORGE_API_LIMIT").and_then(|v| v.parse().ok()) {
            self.api_limit = value;
        }
        if let Some(value) = lookup("PRDFORGE_POLL_INTERVAL")
            .and_then(|v| humantime_serde::re::humantime::parse_duration(&v).ok())
        {
            self.poll_interval = value;
        }
        if let Some(value) = lookup("PRDFORGE_HEARTBEAT_INTERVAL")
            .and_then(|v| humantime_serde::re::humantime::parse_duration(&v).ok())
        {
            self.heartbeat_interval = value;
        }
        if let Some(command) = lookup("PRDFORGE_AGENT_COMMAND") {
            self.agent_command = command;
        }
        if let Some(branch) = lookup("PRDFORGE_BASE_BRANCH") {
            self.base_branch = branch;
        }
    }

    /// Make relative paths absolute against the repository root
    pub fn resolve_paths(&mut self, repo_root: &Path) -> Result<()> {
        if self.state_dir.is_relative() {
            self.state_dir = repo_root.join(&self.state_dir);
        }

        let worktree_root = match self.worktree_root.take() {
            Some(root) if root.is_relative() => repo_root.join(root),
            Some(root) => root,
            None => default_worktree_root(repo_root)?,
        };
        self.worktree_root = Some(worktree_root);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(CoordinatorError::config("max_parallel must be at least 1"));
        }
        if self.api_limit == 0 {
            return Err(CoordinatorError::config("api_limit must be at least 1"));
        }
        if self.checkpoint_retention == 0 {
            return Err(CoordinatorError::config(
                "checkpoint_retention must be at least 1",
            ));
        }
        if self.poll_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(CoordinatorError::config("intervals must be non-zero"));
        }
        self.agent_argv("{workspace}", "{task_id}")?;
        Ok(())
    }

    /// Split `agent_command` and substitute the per-call placeholders
    pub fn agent_argv(&self, workspace: &str, task_id: &str) -> Result<Vec<String>> {
        let words = shell_words::split(&self.agent_command)
            .map_err(|e| CoordinatorError::config(format!("agent_command: {e}")))?;
        if words.is_empty() {
            return Err(CoordinatorError::config("agent_command is empty"));
        }

        Ok(words
            .into_iter()
            .map(|word| {
                word.replace("{workspace}", workspace)
                    .replace("{task_id}", task_id)
            })
            .collect())
    }

    /// Worktree root after [`resolve_paths`](Self::resolve_paths)
    pub fn worktree_root(&self) -> PathBuf {
        self.worktree_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("worktrees"))
    }
}

fn user_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "prdforge", "prdforge")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// `<data dir>/worktrees/<repo name>`, outside the repository's own tree
fn default_worktree_root(repo_root: &Path) -> Result<PathBuf> {
    let repo_name = repo_root
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            CoordinatorError::config(format!(
                "Could not determine repository name from path: {}",
                repo_root.display()
            ))
        })?;

    let dirs = ProjectDirs::from("com", "prdforge", "prdforge")
        .ok_or_else(|| CoordinatorError::config("Could not determine home directory"))?;
    Ok(dirs.data_dir().join("worktrees").join(repo_name))
}
