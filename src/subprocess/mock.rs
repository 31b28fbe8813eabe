//! Scripted [`ProcessRunner`] for unit tests
//!
//! Responses are matched in registration order. A response limited with
//! [`Scripted::times`] stops matching once used up, letting a later entry
//! for the same program take over.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::error::ProcessError;
use super::runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner};

type ArgsMatcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct MockProcessRunner {
    script: Arc<Mutex<Vec<Response>>>,
    calls: Arc<Mutex<Vec<ProcessCommand>>>,
}

struct Response {
    program: String,
    matcher: Option<ArgsMatcher>,
    output: ProcessOutput,
    used: usize,
    limit: Option<usize>,
}

impl Response {
    fn matches(&self, command: &ProcessCommand) -> bool {
        self.program == command.program
            && self.limit.map_or(true, |limit| self.used < limit)
            && self
                .matcher
                .as_ref()
                .map_or(true, |matcher| matcher(&command.args))
    }
}

/// A response being scripted; registered by [`Scripted::finish`]
pub struct Scripted {
    runner: MockProcessRunner,
    response: Response,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next response for `program`; succeeds with empty output by default
    pub fn expect_command(&mut self, program: &str) -> Scripted {
        Scripted {
            runner: self.clone(),
            response: Response {
                program: program.to_string(),
                matcher: None,
                output: ProcessOutput {
                    status: ExitStatus::Success,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::from_millis(1),
                },
                used: 0,
                limit: None,
            },
        }
    }

    /// Every command run so far, oldest first
    pub fn calls(&self) -> Vec<ProcessCommand> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, program: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|cmd| cmd.program == program)
            .count()
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        lock(&self.calls).push(command.clone());

        let mut script = lock(&self.script);
        match script.iter_mut().find(|response| response.matches(&command)) {
            Some(response) => {
                response.used += 1;
                Ok(response.output.clone())
            }
            None => Err(ProcessError::Unscripted(command.display())),
        }
    }
}

impl Scripted {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.response.matcher = Some(Box::new(matcher));
        self
    }

    /// Match git invocations by subcommand, looking past a leading `worktree`
    ///
    /// `with_git_subcommand("list")` matches `git worktree list --porcelain`
    /// and `with_git_subcommand("rev-parse")` matches `git rev-parse ...`.
    pub fn with_git_subcommand(self, subcommand: &'static str) -> Self {
        self.with_args(move |args| {
            let mut words = args.iter().map(String::as_str);
            match words.next() {
                Some("worktree") => words.next() == Some(subcommand),
                first => first == Some(subcommand),
            }
        })
    }

    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        self.response.output.stdout = stdout.to_string();
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        self.response.output.stderr = stderr.to_string();
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.response.output.status = if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        };
        self
    }

    pub fn returns_success(self) -> Self {
        self.returns_exit_code(0)
    }

    pub fn times(mut self, n: usize) -> Self {
        self.response.limit = Some(n);
        self
    }

    pub fn finish(self) {
        lock(&self.runner.script).push(self.response);
    }
}

// A panic while scripting only poisons test state; keep going with the data
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
