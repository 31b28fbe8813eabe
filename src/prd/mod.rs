//! PRD documents: a project description plus the tasks an agent works through
//!
//! The coordinator only checks structure. Whether a task really passes is
//! decided by the agent, which flips `passes` in the worktree's copy.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoordinatorError, IoResultExt, Result};
use crate::storage::write_json_atomic;

/// Field names are snake_case; the camelCase spellings are accepted on input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrdSpec {
    pub project: String,
    #[serde(alias = "branchName")]
    pub branch_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "userStories")]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub passes: bool,
}

impl PrdSpec {
    /// Parse and validate a PRD document
    pub fn parse(contents: &str) -> Result<Self> {
        check_acceptance_criteria(contents)?;

        let spec: PrdSpec = serde_json::from_str(contents)
            .map_err(|e| CoordinatorError::invalid_spec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.with_path(path)?;
        Self::parse(&contents).map_err(|e| match e {
            CoordinatorError::InvalidSpec { code, message } => CoordinatorError::InvalidSpec {
                code,
                message: format!("{}: {message}", path.display()),
            },
            other => other,
        })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self).await
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(CoordinatorError::invalid_spec("project must not be empty"));
        }
        if self.branch_name.trim().is_empty() {
            return Err(CoordinatorError::invalid_spec(
                "branch_name must not be empty",
            ));
        }
        if !is_valid_ref_component(&self.branch_name) {
            return Err(CoordinatorError::invalid_spec(format!(
                "branch_name '{}' is not a valid git branch name",
                self.branch_name
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(CoordinatorError::invalid_spec("task id must not be empty"));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(CoordinatorError::invalid_spec(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
        }
        Ok(())
    }

    /// A PRD is complete only if it has tasks and all of them pass
    pub fn all_tasks_pass(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.passes)
    }

    /// Next task to work on: lowest priority number among unfinished tasks
    pub fn next_task(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .filter(|t| !t.passes)
            .min_by_key(|t| t.priority)
    }

    pub fn pass_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.passes).count()
    }

    /// `task id -> passes`, the state captured in checkpoints
    pub fn pass_state(&self) -> std::collections::BTreeMap<String, bool> {
        self.tasks
            .iter()
            .map(|t| (t.id.clone(), t.passes))
            .collect()
    }
}

/// Base unit id for a PRD file: its sanitized file stem (`auth.v2.json` -> `auth-v2`)
///
/// Independent of the requested branch, so several PRDs may ask for the same one.
pub fn unit_id_for(path: &Path) -> Result<String> {
    let id = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string();
    if id.is_empty() {
        return Err(CoordinatorError::invalid_spec(format!(
            "cannot derive a unit id from {}",
            path.display()
        )));
    }
    Ok(id)
}

/// Reject object-shaped acceptance criteria with a message naming the task
fn check_acceptance_criteria(contents: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(contents)
        .map_err(|e| CoordinatorError::invalid_spec(format!("not valid JSON: {e}")))?;

    let tasks = value
        .get("tasks")
        .or_else(|| value.get("userStories"))
        .and_then(|t| t.as_array());

    for task in tasks.into_iter().flatten() {
        let criteria = task
            .get("acceptance_criteria")
            .or_else(|| task.get("acceptanceCriteria"));
        let Some(serde_json::Value::Array(items)) = criteria else {
            continue;
        };
        if let Some(bad) = items.iter().find(|item| !item.is_string()) {
            let id = task.get("id").and_then(|id| id.as_str()).unwrap_or("<unknown>");
            return Err(CoordinatorError::invalid_spec(format!(
                "task '{id}': acceptance criteria must be plain strings, found {bad}"
            )));
        }
    }
    Ok(())
}

fn is_valid_ref_component(name: &str) -> bool {
    !name.starts_with('-')
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name.contains("//")
        && !name.contains("@{")
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
}
