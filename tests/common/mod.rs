//! Common test utilities and helpers

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Test context builder for setting up test environments
pub struct TestContextBuilder {
    temp_dir: TempDir,
    with_git: bool,
    initial_files: Vec<(PathBuf, String)>,
}

impl TestContextBuilder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: TempDir::new()?,
            with_git: false,
            initial_files: Vec::new(),
        })
    }

    /// Initialize `repo/` as a git repository with one commit on `main`
    pub fn with_git(mut self) -> Self {
        self.with_git = true;
        self
    }

    /// Add an initial file, relative to the context root
    pub fn with_file(mut self, path: impl AsRef<Path>, content: &str) -> Self {
        self.initial_files
            .push((path.as_ref().to_path_buf(), content.to_string()));
        self
    }

    pub fn build(self) -> Result<TestContext> {
        let root = self.temp_dir.path();
        let repo = root.join("repo");
        fs::create_dir_all(&repo)?;

        if self.with_git {
            init_git_repo(&repo)?;
        }

        for (file_path, content) in self.initial_files {
            let full_path = root.join(file_path);
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(full_path, content)?;
        }

        Ok(TestContext {
            temp_dir: self.temp_dir,
        })
    }
}

/// Temporary directory holding a repository, state and worktrees
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn repo(&self) -> PathBuf {
        self.path().join("repo")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path().join("state")
    }

    pub fn worktree_root(&self) -> PathBuf {
        self.path().join("worktrees")
    }

    /// Write a PRD whose tasks each sit on one line, so `sed` can flip them individually
    pub fn write_prd(&self, name: &str, branch: &str, task_ids: &[&str]) -> Result<PathBuf> {
        let tasks: Vec<String> = task_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                format!(
                    r#"    {{"id": "{id}", "title": "task {id}", "acceptance_criteria": ["{id} works"], "priority": {}, "passes": false}}"#,
                    i + 1
                )
            })
            .collect();
        let content = format!(
            "{{\n  \"project\": \"{name}\",\n  \"branch_name\": \"{branch}\",\n  \"tasks\": [\n{}\n  ]\n}}\n",
            tasks.join(",\n")
        );

        let path = self.path().join(format!("{name}.json"));
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Ok(Command::new("git")
            .current_dir(self.repo())
            .args(args)
            .output()?)
    }
}

/// Initialize a git repository with an initial commit on `main`
pub fn init_git_repo(path: &Path) -> Result<()> {
    let run = |args: &[&str]| -> Result<()> {
        let output = Command::new("git").current_dir(path).args(args).output()?;
        anyhow::ensure!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(())
    };

    run(&["init", "--quiet", "--initial-branch=main"])?;
    run(&["config", "user.email", "test@example.com"])?;
    run(&["config", "user.name", "Test User"])?;
    fs::write(path.join("README.md"), "# Test Repository\n")?;
    run(&["add", "README.md"])?;
    run(&["commit", "--quiet", "-m", "Initial commit"])?;
    Ok(())
}

/// Agent command that marks the task it was given as passing
pub const PASSING_AGENT: &str = r#"sh -c 'sed -i "/\"id\": \"{task_id}\"/s/\"passes\": false/\"passes\": true/" prd.json'"#;
