use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// Result alias used across the coordinator
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Stable classification of a failure, persisted in the registry for status queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LockTimeout,
    ResourceExhausted,
    WorktreeError,
    WorkerCrashed,
    CheckpointCorruption,
    RegistryCorruption,
    NotFound,
    InvalidSpec,
    CompletionMismatch,
    Process,
    Io,
    Serialization,
    Config,
}

impl ErrorKind {
    /// Transient conditions are retried with backoff and never fail a unit on their own
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::LockTimeout | ErrorKind::ResourceExhausted)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::WorktreeError => "worktree_error",
            ErrorKind::WorkerCrashed => "worker_crashed",
            ErrorKind::CheckpointCorruption => "checkpoint_corruption",
            ErrorKind::RegistryCorruption => "registry_corruption",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::CompletionMismatch => "completion_mismatch",
            ErrorKind::Process => "process",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// The unified error type for the coordinator and its workers
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("[E{code:04}] Timed out after {waited:?} waiting for lock {}", .path.display())]
    LockTimeout {
        code: u16,
        path: PathBuf,
        waited: Duration,
    },

    #[error("[E{code:04}] Resource exhausted: {message}")]
    ResourceExhausted { code: u16, message: String },

    #[error("[E{code:04}] Git operation '{operation}' failed: {diagnostics}")]
    Worktree {
        code: u16,
        operation: String,
        diagnostics: String,
    },

    #[error("[E{code:04}] Worker for unit {unit_id} crashed: {message}")]
    WorkerCrashed {
        code: u16,
        unit_id: String,
        message: String,
    },

    #[error("[E{code:04}] Corrupt checkpoint {}: {message}", .path.display())]
    CheckpointCorruption {
        code: u16,
        path: PathBuf,
        message: String,
    },

    #[error("[E{code:04}] Corrupt registry {}: {message}", .path.display())]
    RegistryCorruption {
        code: u16,
        path: PathBuf,
        message: String,
    },

    #[error("[E{code:04}] Not found: {0}", code = ErrorCode::NOT_FOUND)]
    NotFound(String),

    #[error("[E{code:04}] Invalid PRD specification: {message}")]
    InvalidSpec { code: u16, message: String },

    #[error("[E{code:04}] Unit {unit_id} reported success but {message}")]
    CompletionMismatch {
        code: u16,
        unit_id: String,
        message: String,
    },

    #[error("[E{code:04}] Configuration error: {message}")]
    Config { code: u16, message: String },

    #[error("[E{code:04}] Process error: {source}", code = ErrorCode::PROCESS)]
    Process {
        #[from]
        source: crate::subprocess::ProcessError,
    },

    #[error("[E{code:04}] I/O error at {}: {source}", .path.display(), code = ErrorCode::IO)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[E{code:04}] Serialization error: {0}", code = ErrorCode::SERIALIZATION)]
    Serialization(#[from] serde_json::Error),
}

impl CoordinatorError {
    pub fn lock_timeout(path: impl Into<PathBuf>, waited: Duration) -> Self {
        Self::LockTimeout {
            code: ErrorCode::LOCK_TIMEOUT,
            path: path.into(),
            waited,
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            code: ErrorCode::RESOURCE_EXHAUSTED,
            message: message.into(),
        }
    }

    pub fn worktree(operation: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self::Worktree {
            code: ErrorCode::WORKTREE,
            operation: operation.into(),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn worker_crashed(unit_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WorkerCrashed {
            code: ErrorCode::WORKER_CRASHED,
            unit_id: unit_id.into(),
            message: message.into(),
        }
    }

    pub fn checkpoint_corruption(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CheckpointCorruption {
            code: ErrorCode::CHECKPOINT_CORRUPTION,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn registry_corruption(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::RegistryCorruption {
            code: ErrorCode::REGISTRY_CORRUPTION,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            code: ErrorCode::INVALID_SPEC,
            message: message.into(),
        }
    }

    pub fn completion_mismatch(unit_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CompletionMismatch {
            code: ErrorCode::COMPLETION_MISMATCH,
            unit_id: unit_id.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            code: ErrorCode::CONFIG,
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classification used for retry decisions and status reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Worktree { .. } => ErrorKind::WorktreeError,
            Self::WorkerCrashed { .. } => ErrorKind::WorkerCrashed,
            Self::CheckpointCorruption { .. } => ErrorKind::CheckpointCorruption,
            Self::RegistryCorruption { .. } => ErrorKind::RegistryCorruption,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidSpec { .. } => ErrorKind::InvalidSpec,
            Self::CompletionMismatch { .. } => ErrorKind::CompletionMismatch,
            Self::Config { .. } => ErrorKind::Config,
            Self::Process { .. } => ErrorKind::Process,
            Self::Io { .. } => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::LockTimeout { code, .. }
            | Self::ResourceExhausted { code, .. }
            | Self::Worktree { code, .. }
            | Self::WorkerCrashed { code, .. }
            | Self::CheckpointCorruption { code, .. }
            | Self::RegistryCorruption { code, .. }
            | Self::InvalidSpec { code, .. }
            | Self::CompletionMismatch { code, .. }
            | Self::Config { code, .. } => *code,
            Self::NotFound(_) => ErrorCode::NOT_FOUND,
            Self::Process { .. } => ErrorCode::PROCESS,
            Self::Io { .. } => ErrorCode::IO,
            Self::Serialization(_) => ErrorCode::SERIALIZATION,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Config | ErrorKind::InvalidSpec => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::LockTimeout | ErrorKind::ResourceExhausted => 75,
            _ => 1,
        }
    }
}

/// Attach a path to a raw `std::io::Error`
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| CoordinatorError::io(path, source))
    }
}
