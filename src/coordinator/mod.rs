//! The parallel execution coordinator
//!
//! A single polling loop owns admission and supervision. Each tick it
//! reclaims orphaned API tokens, checks every active unit's worker, tears
//! down units that reached a terminal state, and admits queued units in FIFO
//! order while slots are free. All shared state lives on disk (registry,
//! token pool, heartbeats, outcome signals), so `submit`, `status` and
//! `stop` can run from other processes while the loop is live.

pub mod status;

pub use status::render_status;

use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, ErrorKind, IoResultExt, Result};
use crate::limiter::{ResourceLimiter, TokenPool};
use crate::prd::{unit_id_for, PrdSpec};
use crate::registry::{
    RegistryDocument, RegistryManager, TerminalStatus, UnitError, UnitRecord, UnitStatus,
};
use crate::storage::{write_atomic, StateLayout};
use crate::subprocess::SubprocessManager;
use crate::supervisor::{
    Observation, OutcomeStatus, WorkerEvent, WorkerOutcome, WorkerState, WorkerSupervisor,
};
use crate::worktree::{WorktreeManager, WorktreeRequest};

pub struct Coordinator {
    config: CoordinatorConfig,
    layout: StateLayout,
    registry: RegistryManager,
    limiter: ResourceLimiter,
    worktrees: WorktreeManager,
    supervisor: WorkerSupervisor,
}

impl Coordinator {
    /// Wire up every component from a resolved config
    ///
    /// # Errors
    /// Fails if the state directory or worktree root cannot be created, or
    /// the worker executable cannot be determined.
    pub fn new(
        config: CoordinatorConfig,
        repo_root: &Path,
        subprocess: SubprocessManager,
    ) -> Result<Self> {
        let layout = StateLayout::new(&config.state_dir);
        layout.ensure()?;

        let registry = RegistryManager::new(
            &layout,
            config.max_parallel,
            config.api_limit,
            config.lock_timeout,
        );
        let tokens = TokenPool::new(&layout, config.api_limit, config.lock_timeout);
        let limiter = ResourceLimiter::new(registry.clone(), tokens);

        let worktrees = WorktreeManager::new(repo_root, &config.worktree_root(), subprocess)?
            .with_prd_file_name(&config.prd_file_name)
            .with_branch_cleanup(config.delete_branch_on_cleanup);

        let worker_program = match &config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().with_path("current executable")?,
        };
        let supervisor = WorkerSupervisor::new(
            layout.clone(),
            worker_program,
            config.heartbeat_interval,
            config.stop_grace_period,
        );

        Ok(Self {
            config,
            layout,
            registry,
            limiter,
            worktrees,
            supervisor,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegistryManager {
        &self.registry
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Validate a PRD, store a copy and append it to the queue
    ///
    /// The unit id is the PRD's file stem. When that id belongs to a live
    /// unit running a different PRD, the first free `<stem>-N` is used
    /// instead; submitting the same document twice is rejected.
    pub async fn submit(&self, prd_path: &Path) -> Result<String> {
        let contents = tokio::fs::read_to_string(prd_path)
            .await
            .with_path(prd_path)?;
        let prd = PrdSpec::parse(&contents)?;
        prd.validate()?;
        let id = self.allocate_unit_id(&unit_id_for(prd_path)?, &contents).await?;

        write_atomic(&self.layout.prd_file(&id), contents.as_bytes()).await?;
        self.registry.enqueue(&id).await?;
        info!(
            "Submitted {} ({} tasks, branch {}) as unit {}",
            prd.project,
            prd.tasks.len(),
            prd.branch_name,
            id
        );
        Ok(id)
    }

    async fn allocate_unit_id(&self, base: &str, contents: &str) -> Result<String> {
        let doc = self.registry.snapshot().await?;
        let live = |id: &str| doc.status_of(id).is_some_and(|s| !s.is_terminal());

        if live(base) {
            let stored = tokio::fs::read_to_string(self.layout.prd_file(base)).await.ok();
            if stored.as_deref() == Some(contents) {
                let status = doc.status_of(base).map(|s| s.to_string()).unwrap_or_default();
                return Err(CoordinatorError::invalid_spec(format!(
                    "unit '{base}' is already {status}"
                )));
            }
        }

        Ok(std::iter::once(base.to_string())
            .chain((2..).map(|n| format!("{base}-{n}")))
            .find(|candidate| !live(candidate))
            .unwrap_or_else(|| base.to_string()))
    }

    pub async fn status(&self) -> Result<RegistryDocument> {
        self.registry.snapshot().await
    }

    /// Run until interrupted by Ctrl-C or SIGTERM
    pub async fn run(&self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the polling loop until `shutdown` resolves, then stop every worker
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.write_config_snapshot().await?;
        self.registry
            .set_limits(self.config.max_parallel, self.config.api_limit)
            .await?;
        self.reconcile_startup().await?;

        info!(
            "Coordinator started: max_parallel={}, api_limit={}, polling every {:?}",
            self.config.max_parallel, self.config.api_limit, self.config.poll_interval
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        if e.is_transient() {
                            debug!("Tick deferred: {}", e);
                        } else {
                            error!("Tick failed: {}", e);
                        }
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// One pass of supervision and admission
    pub async fn tick(&self) -> Result<()> {
        if let Err(e) = self.limiter.reconcile().await {
            warn!("Token reconciliation failed: {}", e);
        }

        let active = self.registry.list_active().await?;
        for record in &active {
            if let Err(e) = self.poll(record).await {
                if e.is_transient() {
                    debug!("Poll of {} deferred: {}", record.id, e);
                } else {
                    // Structural failures end this unit only
                    error!("Unit {} failed: {}", record.id, e);
                    if let Err(finalize_error) = self.fail_unit(record, &e).await {
                        error!("Could not finalize {}: {}", record.id, finalize_error);
                    }
                }
            }
        }

        self.admit_queued().await?;

        let active = self.registry.list_active().await?;
        let ids: HashSet<String> = active.iter().map(|record| record.id.clone()).collect();
        self.supervisor.retain_children(&ids);

        match self.limiter.tokens_by_unit().await {
            Ok(held) => self.registry.set_tokens_held(&held).await?,
            Err(e) => warn!("Token holdings not refreshed: {}", e),
        }
        Ok(())
    }

    /// Stop one unit, whether it is running or still queued
    pub async fn stop_unit(&self, id: &str) -> Result<()> {
        let record = match self.registry.get(id).await {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return match self.registry.deregister(id, TerminalStatus::Stopped).await? {
                    Some(_) => {
                        info!("Removed queued unit {}", id);
                        Ok(())
                    }
                    None => Err(e),
                };
            }
            Err(e) => return Err(e),
        };

        let state = self.advance(&record, WorkerEvent::StopRequested)?;
        if let Some(pid) = record.worker_pid {
            let stopped = self.supervisor.stop(id, pid).await?;
            info!("Stopped worker for {}: {:?}", id, stopped);
        }
        debug!("Unit {} is {:?}", id, state);
        self.finalize(&record, TerminalStatus::Stopped, None).await
    }

    /// Stop every worker and return all tokens
    pub async fn shutdown(&self) -> Result<()> {
        let active = self.registry.list_active().await?;
        info!("Stopping {} active unit(s)", active.len());

        for record in &active {
            if let Some(pid) = record.worker_pid {
                if let Err(e) = self.supervisor.stop(&record.id, pid).await {
                    warn!("Failed to stop worker for {}: {}", record.id, e);
                }
            }
            if let Err(e) = self.finalize(record, TerminalStatus::Stopped, None).await {
                warn!("Failed to finalize {}: {}", record.id, e);
            }
        }

        let released = self.limiter.tokens().release_all().await?;
        if !released.is_empty() {
            info!("Released {} API token(s)", released.len());
        }
        Ok(())
    }

    /// Check registry entries against reality after a restart
    ///
    /// Live workers are adopted as-is. Dead ones are left for the first tick,
    /// which sees them as crashed and applies the restart policy.
    async fn reconcile_startup(&self) -> Result<()> {
        let reclaimed = self.limiter.reconcile().await?;
        if reclaimed > 0 {
            info!("Reclaimed {} token(s) from dead processes", reclaimed);
        }

        for record in self.registry.list_active().await? {
            match record.worker_pid {
                Some(pid) if crate::supervisor::is_alive(pid) => {
                    info!("Adopting running worker for {} (pid {})", record.id, pid);
                }
                Some(pid) => {
                    warn!("Worker for {} (pid {}) died while we were away", record.id, pid);
                }
                None => {
                    warn!("Unit {} was admitted but never launched", record.id);
                }
            }
        }
        Ok(())
    }

    async fn write_config_snapshot(&self) -> Result<()> {
        let snapshot = self.config.to_toml()?;
        write_atomic(&self.layout.config_snapshot(), snapshot.as_bytes()).await
    }

    async fn poll(&self, record: &UnitRecord) -> Result<()> {
        match self.supervisor.observe(record).await {
            Observation::Starting => Ok(()),
            Observation::Running(heartbeat) => {
                if record.status == UnitStatus::Starting {
                    self.advance(record, WorkerEvent::HeartbeatReceived)?;
                    self.registry
                        .update_status(&record.id, UnitStatus::Active)
                        .await?;
                    info!(
                        "Unit {} is running (pid {}, iteration {})",
                        record.id, heartbeat.pid, heartbeat.iteration
                    );
                }
                Ok(())
            }
            Observation::Exited(outcome) => self.finish(record, outcome).await,
            Observation::Crashed(reason) => self.recover(record, reason).await,
        }
    }

    /// Settle a unit whose worker reported an outcome
    async fn finish(&self, record: &UnitRecord, outcome: WorkerOutcome) -> Result<()> {
        let error = match outcome.status {
            OutcomeStatus::Completed => self.verify_completion(record).await.err(),
            OutcomeStatus::Failed => Some(UnitError::new(
                outcome.error_kind.unwrap_or(ErrorKind::Process),
                outcome.message.clone(),
            )),
        };

        let (event, status) = match error {
            None => (WorkerEvent::ExitedSuccess, TerminalStatus::Completed),
            Some(_) => (WorkerEvent::ExitedFailure, TerminalStatus::Failed),
        };
        self.advance(record, event)?;
        info!(
            "Unit {} finished as {:?} after {} iteration(s)",
            record.id, status, outcome.iterations
        );
        self.finalize(record, status, error).await
    }

    /// A success signal only counts if the PRD in the worktree agrees
    async fn verify_completion(&self, record: &UnitRecord) -> std::result::Result<(), UnitError> {
        let Some(worktree) = &record.worktree_path else {
            let e = CoordinatorError::completion_mismatch(&record.id, "it has no worktree");
            return Err(UnitError::from(&e));
        };

        let prd = PrdSpec::load(&self.worktrees.prd_path(worktree))
            .await
            .map_err(|e| UnitError::from(&e))?;
        if prd.all_tasks_pass() {
            return Ok(());
        }

        let e = CoordinatorError::completion_mismatch(
            &record.id,
            format!("only {}/{} tasks pass", prd.pass_count(), prd.tasks.len()),
        );
        warn!("{}", e);
        Err(UnitError::from(&e))
    }

    /// Restart a crashed worker from its latest valid checkpoint, or fail it
    async fn recover(&self, record: &UnitRecord, reason: String) -> Result<()> {
        let crashed = self.advance(record, WorkerEvent::HeartbeatStale)?;
        warn!("Worker for {} crashed: {}", record.id, reason);

        // A hung worker may still hold its process group and tokens
        if let Some(pid) = record.worker_pid {
            self.supervisor.stop(&record.id, pid).await?;
        }
        self.limiter.tokens().release_unit(&record.id).await?;

        let crash = CoordinatorError::worker_crashed(&record.id, &reason);
        if record.restarts >= self.config.max_restarts {
            self.step(record, crashed, WorkerEvent::RestartsExhausted)?;
            info!(
                "Unit {} used all {} restart(s)",
                record.id, self.config.max_restarts
            );
            return self
                .finalize(record, TerminalStatus::Failed, Some(UnitError::from(&crash)))
                .await;
        }

        let Some(worktree) = record.worktree_path.clone() else {
            return self
                .finalize(record, TerminalStatus::Failed, Some(UnitError::from(&crash)))
                .await;
        };
        self.step(record, crashed, WorkerEvent::Restart)?;

        let checkpoints = self.checkpoints(&record.id);
        let resume = match checkpoints.restore_latest().await {
            Ok(Some(stored)) => {
                info!(
                    "Restarting {} from iteration {} ({:?})",
                    record.id, stored.data.iteration, stored.data.phase
                );
                Some(stored.path)
            }
            Ok(None) => {
                info!("Restarting {} from scratch; no checkpoints", record.id);
                None
            }
            Err(e) => {
                error!("No usable checkpoint for {}: {}", record.id, e);
                return self
                    .finalize(record, TerminalStatus::Failed, Some(UnitError::from(&e)))
                    .await;
            }
        };

        let pid = self
            .supervisor
            .launch(&record.id, &worktree, resume.as_deref())
            .await?;
        self.registry
            .update_record(&record.id, |r| {
                r.status = UnitStatus::Starting;
                r.worker_pid = Some(pid);
                r.launched_at = Some(Utc::now());
                r.restarts += 1;
                r.last_error = Some(UnitError::from(&crash));
            })
            .await?;
        Ok(())
    }

    /// Admit queued units in order while slots are free
    async fn admit_queued(&self) -> Result<()> {
        while self.limiter.can_admit().await {
            let Some(id) = self.registry.queued().await?.into_iter().next() else {
                break;
            };
            match self.admit(&id).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    debug!("Admission of {} deferred: {}", id, e);
                    break;
                }
                Err(e) => {
                    error!("Failed to admit {}: {}", id, e);
                    self.fail_admission(&id, &e).await?;
                }
            }
        }
        Ok(())
    }

    async fn admit(&self, id: &str) -> Result<()> {
        let prd_source = self.layout.prd_file(id);
        let prd = PrdSpec::load(&prd_source).await?;

        let record = self.registry.register(id, &prd.branch_name).await?;
        self.step(&record, WorkerState::Queued, WorkerEvent::Admitted)?;

        let reserved_branches = self
            .registry
            .list_active()
            .await?
            .into_iter()
            .filter(|other| other.id != id)
            .map(|other| other.branch)
            .collect();
        let request = WorktreeRequest {
            desired_branch: prd.branch_name.clone(),
            base_branch: self.config.base_branch.clone(),
            prd_source,
            reserved_branches,
        };

        let worktree = self.worktrees.create(id, &request).await?;
        let record = self
            .registry
            .update_record(id, |r| {
                r.branch = worktree.branch.clone();
                r.worktree_path = Some(worktree.path.clone());
            })
            .await?;

        // A resubmitted unit starts a fresh run
        self.checkpoints(id).clear().await?;

        let pid = self.supervisor.launch(id, &worktree.path, None).await?;
        self.registry
            .update_record(id, |r| {
                r.worker_pid = Some(pid);
                r.launched_at = Some(Utc::now());
            })
            .await?;
        info!(
            "Admitted {} on branch {} (waited {})",
            id,
            record.branch,
            record
                .queued_at
                .map(|at| format!("{}s", (Utc::now() - at).num_seconds()))
                .unwrap_or_else(|| "-".to_string())
        );
        Ok(())
    }

    /// Mark a unit that could not be admitted as failed and clean up after it
    async fn fail_admission(&self, id: &str, e: &CoordinatorError) -> Result<()> {
        match self.registry.get(id).await {
            Ok(record) => self.fail_unit(&record, e).await,
            Err(_) => {
                // Never left the queue
                self.registry
                    .deregister_with_error(id, TerminalStatus::Failed, Some(UnitError::from(e)))
                    .await?;
                Ok(())
            }
        }
    }

    async fn fail_unit(&self, record: &UnitRecord, e: &CoordinatorError) -> Result<()> {
        if let Some(pid) = record.worker_pid {
            if let Err(stop_error) = self.supervisor.stop(&record.id, pid).await {
                warn!("Failed to stop worker for {}: {}", record.id, stop_error);
            }
        }
        self.finalize(record, TerminalStatus::Failed, Some(UnitError::from(e)))
            .await
    }

    /// Release everything a unit holds and move it to its terminal list
    ///
    /// Worktree removal failures are logged; they never keep a unit active.
    async fn finalize(
        &self,
        record: &UnitRecord,
        status: TerminalStatus,
        error: Option<UnitError>,
    ) -> Result<()> {
        if let Err(e) = self.worktrees.remove(&record.id).await {
            warn!("Failed to remove worktree for {}: {}", record.id, e);
        }
        self.limiter.tokens().release_unit(&record.id).await?;
        self.supervisor.forget(&record.id);

        let removed = self
            .registry
            .deregister_with_error(&record.id, status, error)
            .await?;
        if removed.is_some() {
            self.step(record, WorkerState::from_status(status.into()), WorkerEvent::Deregister)?;
        }
        Ok(())
    }

    /// Apply `event` to the state persisted for `record`
    fn advance(&self, record: &UnitRecord, event: WorkerEvent) -> Result<WorkerState> {
        self.step(record, WorkerState::from_status(record.status), event)
    }

    /// A transition the lifecycle rejects means the registry contradicts what we observed
    fn step(&self, record: &UnitRecord, from: WorkerState, event: WorkerEvent) -> Result<WorkerState> {
        from.transition(event).map_err(|e| {
            CoordinatorError::registry_corruption(
                self.registry.path(),
                format!("unit {}: {}", record.id, e),
            )
        })
    }

    fn checkpoints(&self, id: &str) -> CheckpointManager {
        CheckpointManager::new(
            self.layout.checkpoints_dir(id),
            id,
            self.config.checkpoint_retention,
        )
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
