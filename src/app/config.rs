//! Application configuration
//!
//! Process-wide settings that come from the command line rather than from
//! the coordinator's config file.

use anyhow::Result;
use std::path::PathBuf;

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Verbosity level for logging
    pub verbose: u8,
    /// Repository the coordinator operates on
    pub repo_root: PathBuf,
}

impl AppConfig {
    /// Create a new application configuration rooted at the current directory
    pub fn new(verbose: u8) -> Result<Self> {
        let repo_root = std::env::current_dir()
            .map_err(|e| anyhow::anyhow!("Failed to get current directory: {}", e))?;

        Ok(Self { verbose, repo_root })
    }

    /// Set the repository root
    pub fn with_repo_root(mut self, dir: PathBuf) -> Self {
        self.repo_root = dir;
        self
    }

    /// Get the log filter based on verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            2 => "trace",
            _ => "trace,tokio=debug,mio=debug",
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            verbose: 0,
            repo_root: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_by_verbosity() {
        let config = AppConfig::default();
        assert_eq!(config.log_level(), "info");
        assert_eq!(AppConfig { verbose: 1, ..config.clone() }.log_level(), "debug");
        assert_eq!(AppConfig { verbose: 2, ..config.clone() }.log_level(), "trace");
        assert!(AppConfig { verbose: 5, ..config }.log_level().starts_with("trace,"));
    }

    #[test]
    fn test_with_repo_root() {
        let config = AppConfig::default().with_repo_root(PathBuf::from("/repo"));
        assert_eq!(config.repo_root, PathBuf::from("/repo"));
    }
}
