/// Error code registry for the coordinator
///
/// Codes are grouped by the component that raises them:
/// - 1000-1999: Configuration and input validation
/// - 2000-2999: Registry and locking
/// - 3000-3999: Worktrees and git
/// - 4000-4999: Worker processes
/// - 5000-5999: Checkpoints
/// - 9000-9999: Other errors
pub struct ErrorCode;

impl ErrorCode {
    pub const CONFIG: u16 = 1000;
    pub const INVALID_SPEC: u16 = 1001;

    pub const LOCK_TIMEOUT: u16 = 2000;
    pub const RESOURCE_EXHAUSTED: u16 = 2001;
    pub const REGISTRY_CORRUPTION: u16 = 2002;
    pub const NOT_FOUND: u16 = 2003;

    pub const WORKTREE: u16 = 3000;

    pub const WORKER_CRASHED: u16 = 4000;
    pub const PROCESS: u16 = 4001;
    pub const COMPLETION_MISMATCH: u16 = 4002;

    pub const CHECKPOINT_CORRUPTION: u16 = 5000;

    pub const IO: u16 = 9000;
    pub const SERIALIZATION: u16 = 9001;
}

/// Get a short description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        ErrorCode::CONFIG => "Invalid or unreadable configuration",
        ErrorCode::INVALID_SPEC => "PRD specification failed structural validation",
        ErrorCode::LOCK_TIMEOUT => "Advisory lock not acquired within its bound",
        ErrorCode::RESOURCE_EXHAUSTED => "No admission slot or API token available",
        ErrorCode::REGISTRY_CORRUPTION => "Registry document could not be parsed",
        ErrorCode::NOT_FOUND => "Requested unit or file does not exist",
        ErrorCode::WORKTREE => "Git worktree operation failed",
        ErrorCode::WORKER_CRASHED => "Worker stopped heartbeating or exited without a signal",
        ErrorCode::PROCESS => "Subprocess could not be spawned or controlled",
        ErrorCode::COMPLETION_MISMATCH => "Worker success signal contradicts task state",
        ErrorCode::CHECKPOINT_CORRUPTION => "Checkpoint failed integrity validation",
        ErrorCode::IO => "Filesystem operation failed",
        ErrorCode::SERIALIZATION => "JSON encoding or decoding failed",
        _ => "Unknown error",
    }
}
