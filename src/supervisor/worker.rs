//! The worker side: iterate the coding agent over a unit's PRD
//!
//! A worker runs inside its unit's worktree. Each iteration picks the
//! unfinished task with the lowest priority number, checkpoints, invokes the
//! agent under an API token, re-reads the PRD and checkpoints again. The
//! loop ends when every task passes or the iteration budget is spent, and the
//! result is published as an outcome signal before the process exits.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::heartbeat::HeartbeatWriter;
use super::outcome::WorkerOutcome;
use crate::checkpoint::{CheckpointData, CheckpointManager, Phase};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, ErrorKind, Result};
use crate::limiter::TokenPool;
use crate::prd::PrdSpec;
use crate::storage::StateLayout;
use crate::subprocess::{ProcessCommandBuilder, ProcessError, ProcessRunner, SubprocessManager};

/// Story id recorded before any task has been picked
const SETUP_STORY: &str = "setup";

#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub state_dir: PathBuf,
    pub unit_id: String,
    pub workspace: PathBuf,
    pub resume_from: Option<PathBuf>,
}

pub struct Worker {
    args: WorkerArgs,
    config: CoordinatorConfig,
    layout: StateLayout,
    checkpoints: CheckpointManager,
    tokens: TokenPool,
    runner: Arc<dyn ProcessRunner>,
}

impl Worker {
    /// Build a worker using the coordinator's config snapshot
    pub fn from_state_dir(args: WorkerArgs, subprocess: SubprocessManager) -> Result<Self> {
        let layout = StateLayout::new(&args.state_dir);
        let snapshot = layout.config_snapshot();
        let config = if snapshot.exists() {
            CoordinatorConfig::from_file(&snapshot)?
        } else {
            warn!(
                "No config snapshot at {}; using defaults",
                snapshot.display()
            );
            CoordinatorConfig::default()
        };
        Ok(Self::new(args, config, subprocess))
    }

    pub fn new(args: WorkerArgs, config: CoordinatorConfig, subprocess: SubprocessManager) -> Self {
        let layout = StateLayout::new(&args.state_dir);
        let checkpoints = CheckpointManager::new(
            layout.checkpoints_dir(&args.unit_id),
            &args.unit_id,
            config.checkpoint_retention,
        );
        let tokens = TokenPool::new(&layout, config.api_limit, config.lock_timeout);
        Self {
            args,
            config,
            layout,
            checkpoints,
            tokens,
            runner: subprocess.runner(),
        }
    }

    fn prd_path(&self) -> PathBuf {
        self.args.workspace.join(&self.config.prd_file_name)
    }

    /// Run to completion and publish the outcome signal
    ///
    /// Errors that prevent the loop from running at all are reported as a
    /// failed outcome too, so the coordinator never mistakes them for a crash.
    pub async fn run(&self) -> Result<WorkerOutcome> {
        let unit_id = &self.args.unit_id;
        let heartbeat = HeartbeatWriter::start(
            self.layout.heartbeat_file(unit_id),
            unit_id,
            self.config.heartbeat_interval,
        )
        .await?;

        let outcome = match self.iterate(&heartbeat).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Worker for {} failed: {}", unit_id, e);
                WorkerOutcome::failed(unit_id, 0, e.kind(), e.to_string())
            }
        };

        heartbeat.stop();
        outcome.write(&self.layout.result_file(unit_id)).await?;
        info!(
            "Worker for {} finished: {:?} after {} iteration(s): {}",
            unit_id, outcome.status, outcome.iterations, outcome.message
        );
        Ok(outcome)
    }

    async fn iterate(&self, heartbeat: &HeartbeatWriter) -> Result<WorkerOutcome> {
        let unit_id = &self.args.unit_id;
        let prd_path = self.prd_path();
        let mut iteration = self.starting_iteration().await?;

        loop {
            let prd = PrdSpec::load(&prd_path).await?;

            if prd.tasks.is_empty() {
                return Ok(WorkerOutcome::failed(
                    unit_id,
                    iteration,
                    ErrorKind::InvalidSpec,
                    "PRD has no tasks",
                ));
            }

            if prd.all_tasks_pass() {
                self.checkpoint(SETUP_STORY, iteration, Phase::Completed, &prd)
                    .await?;
                return Ok(WorkerOutcome::completed(
                    unit_id,
                    iteration,
                    format!("all {} tasks pass", prd.tasks.len()),
                ));
            }

            if iteration >= self.config.max_iterations {
                return Ok(WorkerOutcome::failed(
                    unit_id,
                    iteration,
                    ErrorKind::ResourceExhausted,
                    format!(
                        "iteration limit {} reached with {}/{} tasks passing",
                        self.config.max_iterations,
                        prd.pass_count(),
                        prd.tasks.len()
                    ),
                ));
            }

            let Some(task) = prd.next_task() else {
                return Err(CoordinatorError::invalid_spec("no unfinished task to pick"));
            };
            let task_id = task.id.clone();
            info!(
                "Iteration {} of {}: task {} ({})",
                iteration + 1,
                self.config.max_iterations,
                task_id,
                task.title
            );

            self.checkpoint(&task_id, iteration, Phase::BeforeAgent, &prd)
                .await?;
            heartbeat.pulse(iteration, Some(&task_id)).await?;

            match self.run_agent(&task_id).await {
                Ok(()) => {}
                // Waiting for a token is not progress; try again without spending an iteration
                Err(e) if e.is_transient() => {
                    warn!("Agent for {} deferred: {}", task_id, e);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let prd = PrdSpec::load(&prd_path).await?;
            self.checkpoint(&task_id, iteration, Phase::AfterAgent, &prd)
                .await?;
            iteration += 1;
            heartbeat.pulse(iteration, None).await?;
        }
    }

    /// Iteration to continue from, based on `--resume-from` if given
    async fn starting_iteration(&self) -> Result<u32> {
        let Some(path) = &self.args.resume_from else {
            self.checkpoint_setup().await?;
            return Ok(0);
        };

        let data = match self.checkpoints.restore(path).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Resume checkpoint unusable ({}); trying older ones", e);
                match self.checkpoints.restore_latest().await? {
                    Some(stored) => stored.data,
                    None => {
                        self.checkpoint_setup().await?;
                        return Ok(0);
                    }
                }
            }
        };

        self.restore_task_state(&data).await?;
        Ok(resume_iteration(&data))
    }

    /// Bring the worktree PRD back in line with a checkpoint's pass state
    ///
    /// A task recorded as passing is marked passing again; a task the PRD
    /// already marks passing stays so, since the agent may have finished it
    /// after the checkpoint was taken. A PRD that no longer loads is rebuilt
    /// from the submitted copy.
    async fn restore_task_state(&self, data: &CheckpointData) -> Result<()> {
        let recorded: BTreeMap<String, bool> = match serde_json::from_value(data.state.clone()) {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!("Checkpoint carries no usable task state ({}); keeping the PRD", e);
                return Ok(());
            }
        };

        let prd_path = self.prd_path();
        let (mut prd, mut changed) = match PrdSpec::load(&prd_path).await {
            Ok(prd) => (prd, false),
            Err(e) => {
                let submitted = self.layout.prd_file(&self.args.unit_id);
                warn!(
                    "PRD in workspace is unusable ({}); rebuilding from {}",
                    e,
                    submitted.display()
                );
                (PrdSpec::load(&submitted).await.map_err(|_| e)?, true)
            }
        };

        for task in prd.tasks.iter_mut().filter(|t| !t.passes) {
            if recorded.get(&task.id).copied().unwrap_or(false) {
                task.passes = true;
                changed = true;
            }
        }

        if changed {
            info!(
                "Restored task state from checkpoint: {}/{} tasks passing",
                prd.pass_count(),
                prd.tasks.len()
            );
            prd.save(&prd_path).await?;
        }
        Ok(())
    }

    async fn checkpoint_setup(&self) -> Result<()> {
        let prd = PrdSpec::load(&self.prd_path()).await?;
        self.checkpoint(SETUP_STORY, 0, Phase::Setup, &prd).await
    }

    async fn checkpoint(&self, story_id: &str, iteration: u32, phase: Phase, prd: &PrdSpec) -> Result<()> {
        let snapshot = serde_json::to_value(prd.pass_state())?;
        self.checkpoints
            .save(story_id, iteration, phase, snapshot)
            .await?;
        Ok(())
    }

    /// One agent invocation under a scoped API token
    async fn run_agent(&self, task_id: &str) -> Result<()> {
        let unit_id = &self.args.unit_id;
        // Fallible setup first, so an error here never holds a token
        let workspace = self.args.workspace.to_string_lossy().to_string();
        let argv = self.config.agent_argv(&workspace, task_id)?;
        let command = ProcessCommandBuilder::from_argv(&argv)
            .ok_or_else(|| CoordinatorError::config("agent_command is empty"))?
            .current_dir(&self.args.workspace)
            .env("PRDFORGE_UNIT_ID", unit_id)
            .env("PRDFORGE_TASK_ID", task_id)
            .timeout(self.config.agent_timeout)
            .build();

        let token = self
            .tokens
            .acquire(unit_id, self.config.token_timeout)
            .await?;
        let result = self.runner.run(command).await;
        token.release().await?;

        match result {
            Ok(output) if output.status.success() => {
                debug!("Agent finished task {} in {:?}", task_id, output.duration);
                Ok(())
            }
            Ok(output) => {
                // The PRD decides progress; a failing agent run just spends the iteration
                warn!(
                    "Agent exited with {:?} on task {}: {}",
                    output.status,
                    task_id,
                    output.diagnostics()
                );
                Ok(())
            }
            Err(ProcessError::Timeout(limit)) => {
                warn!("Agent timed out after {:?} on task {}", limit, task_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// An interrupted iteration is redone; a finished one is not
fn resume_iteration(data: &CheckpointData) -> u32 {
    match data.phase {
        Phase::AfterAgent => data.iteration + 1,
        Phase::Setup | Phase::BeforeAgent | Phase::Completed => data.iteration,
    }
}

/// Entry point for the `worker` subcommand
pub async fn run_worker(args: WorkerArgs) -> Result<WorkerOutcome> {
    let worker = Worker::from_state_dir(args, SubprocessManager::production())?;
    worker.run().await
}
