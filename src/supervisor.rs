// src/supervisor.rs
//
// The Supervisor Loop (§4.8): the long-running tick loop
// that drives crash recovery, timeout enforcement, zombie reclaim, and
// dispatch. A `loop { ...; sleep }` with each unit of work
// independently fault-isolated, structured around the four ordered,
// independently-failing phases named in §4.8.

use crate::gpu_manager::GpuManager;
use crate::logging::LogContext;
use crate::model::{CaseStatus, GpuStatus};
use crate::remote::executor::{RemoteExecutor, TaskPollResult};
use crate::remote::TaskLookup;
use crate::scheduler::PriorityScheduler;
use crate::store::Store;
use crate::worker_pool::WorkerPool;
use crate::{log_error, log_info, log_warn};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// The hardcoded recovery progress value from §8 Scenario 2: a case
/// whose submission is rediscovered after a restart jumps straight to
/// 30%, independent of whichever step's own `start_progress` would
/// otherwise apply — the workflow state machine no longer owns this
/// case once Phase 1 has reattached it to a running remote task.
const RECOVERY_PROGRESS: i64 = 30;

pub struct SupervisorLoop {
    store: Arc<Store>,
    remote: Arc<dyn RemoteExecutor>,
    gpu_manager: Arc<GpuManager>,
    scheduler: Arc<PriorityScheduler>,
    worker_pool: Arc<WorkerPool>,
    sleep_interval: Duration,
    running_case_timeout: chrono::Duration,
    gpu_refresh_interval_iterations: u64,
    batch_size: usize,
}

impl SupervisorLoop {
    pub fn new(
        store: Arc<Store>,
        remote: Arc<dyn RemoteExecutor>,
        gpu_manager: Arc<GpuManager>,
        scheduler: Arc<PriorityScheduler>,
        worker_pool: Arc<WorkerPool>,
        sleep_interval_seconds: u64,
        running_case_timeout_hours: f64,
        gpu_refresh_interval_iterations: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            remote,
            gpu_manager,
            scheduler,
            worker_pool,
            sleep_interval: Duration::from_secs(sleep_interval_seconds),
            running_case_timeout: chrono::Duration::milliseconds(
                (running_case_timeout_hours * 3_600_000.0) as i64,
            ),
            gpu_refresh_interval_iterations,
            batch_size,
        }
    }

    /// Runs forever. Each phase is independently fault-isolated: a
    /// phase that returns an error is logged and skipped for this
    /// tick, never aborting the loop (§4.8).
    pub async fn run(&self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut iteration: u64 = 0;
        let mut shutdown = shutdown;

        loop {
            if *shutdown.borrow() {
                log_info!(LogContext::new("supervisor_loop"), "shutdown requested, stopping");
                return;
            }

            iteration += 1;
            let refresh_gpus = iteration % self.gpu_refresh_interval_iterations == 0;
            self.tick(refresh_gpus).await;

            tokio::select! {
                _ = tokio::time::sleep(self.sleep_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Runs the four ordered phases once (§4.8), plus GPU discovery/
    /// reconciliation when `refresh_gpus` is set. Exposed publicly so
    /// that the literal end-to-end scenarios in §8 — each phrased as
    /// "run one tick" — can be driven directly from integration tests
    /// without waiting on the sleep interval.
    pub async fn tick(&self, refresh_gpus: bool) {
        if let Err(e) = self.phase_recover_submitting().await {
            log_error!(LogContext::new("supervisor_phase1"), "recover-submitting phase failed: {e}");
        }
        if let Err(e) = self.phase_manage_running().await {
            log_error!(LogContext::new("supervisor_phase2"), "manage-running phase failed: {e}");
        }
        if let Err(e) = self.phase_reclaim_zombies().await {
            log_error!(LogContext::new("supervisor_phase3"), "reclaim-zombies phase failed: {e}");
        }

        if refresh_gpus {
            if let Err(e) = self.gpu_manager.discover_groups().await {
                log_warn!(LogContext::new("supervisor_gpu_refresh"), "discover_groups failed: {e}");
            }
            if let Err(e) = self.gpu_manager.reconcile().await {
                log_warn!(LogContext::new("supervisor_gpu_refresh"), "reconcile failed: {e}");
            }
        }

        if let Err(e) = self.phase_dispatch_submitted().await {
            log_error!(LogContext::new("supervisor_phase4"), "dispatch phase failed: {e}");
        }
    }

    /// Phase 1: rediscover submissions a crashed-and-restarted process
    /// lost track of (§4.8/§8 Scenario 2).
    async fn phase_recover_submitting(&self) -> anyhow::Result<()> {
        let stuck = self.store.list_cases_by_status(CaseStatus::Submitting, None)?;
        for case in stuck {
            let ctx = LogContext::new("supervisor_recover").case(case.id);
            match self.remote.find_task_by_label(&case.recovery_label_prefix()).await {
                TaskLookup::Found(task_id) => {
                    log_info!(ctx, "rediscovered remote task {task_id}");
                    self.store.set_case_remote_task_id(case.id, task_id)?;
                    self.store
                        .update_case_status(case.id, CaseStatus::Running, RECOVERY_PROGRESS)?;
                }
                TaskLookup::NotFound => {
                    log_warn!(ctx, "no remote task found for stuck submitting case, submission never landed");
                    self.store.set_case_error(case.id, "no remote task found for stuck submitting case")?;
                    self.store.update_case_completion(case.id, CaseStatus::Failed)?;
                    self.store.release_gpu(case.id)?;
                }
                TaskLookup::Unreachable => {
                    log_warn!(ctx, "remote unreachable, deferring recovery to next tick");
                }
            }
        }
        Ok(())
    }

    /// Phase 2: enforce `running_case_timeout_hours` and poll cases
    /// with no active worker attached. A polled success/failure here
    /// bypasses download/postprocess deliberately (§4.8/§9): this path
    /// exists only to recover a case that the Worker Pool already
    /// abandoned, and the worker's own poll step is what drives the
    /// normal download/postprocess continuation while a worker is
    /// still attached.
    async fn phase_manage_running(&self) -> anyhow::Result<()> {
        let running = self.store.list_cases_by_status(CaseStatus::Running, None)?;
        let now = Utc::now();

        for case in running {
            let ctx = LogContext::new("supervisor_manage_running").case(case.id);
            let Some(task_id) = case.remote_task_id else {
                continue;
            };

            if now - case.status_updated_at > self.running_case_timeout {
                log_warn!(ctx, "running case exceeded timeout, killing remote task {task_id}");
                if self.remote.kill_task(task_id).await {
                    self.store.set_case_error(case.id, "running case exceeded timeout")?;
                    self.store.update_case_completion(case.id, CaseStatus::Failed)?;
                    self.store.release_gpu(case.id)?;
                } else {
                    log_error!(ctx, "kill failed, marking gpu as zombie");
                    if let Some(gpu) = self.store.get_gpu_by_case(case.id)? {
                        self.store.set_gpu_status(&gpu.group_name, GpuStatus::Zombie, Some(case.id))?;
                    }
                }
                continue;
            }

            match self.remote.poll_task_status(task_id).await {
                TaskPollResult::Success => {
                    log_info!(ctx, "orphaned running case polled success, completing without an active worker");
                    self.store.update_case_completion(case.id, CaseStatus::Completed)?;
                    self.store.release_gpu(case.id)?;
                }
                TaskPollResult::Failure => {
                    self.store.set_case_error(case.id, "remote task reported failure")?;
                    self.store.update_case_completion(case.id, CaseStatus::Failed)?;
                    self.store.release_gpu(case.id)?;
                }
                TaskPollResult::NotFound => {
                    log_warn!(ctx, "remote task not found, leaving status unchanged for next tick");
                }
                TaskPollResult::Running | TaskPollResult::Unreachable => {}
            }
        }
        Ok(())
    }

    /// Phase 3: retry killing the remote task behind each `zombie` GPU
    /// row. A zombie only clears once the kill finally succeeds —
    /// until then it stays excluded from dispatch (§4.7/§9: the
    /// ambiguity in how quickly a zombie must be detected is preserved
    /// as-is rather than guessed at).
    async fn phase_reclaim_zombies(&self) -> anyhow::Result<()> {
        let zombies = self.store.list_gpu_resources_by_status(GpuStatus::Zombie)?;
        for gpu in zombies {
            let Some(case_id) = gpu.assigned_case_id else {
                self.store.set_gpu_status(&gpu.group_name, GpuStatus::Available, None)?;
                continue;
            };
            let ctx = LogContext::new("supervisor_reclaim_zombie").gpu_group(gpu.group_name.clone());

            let Some(case) = self.store.get_case(case_id)? else {
                self.store.set_gpu_status(&gpu.group_name, GpuStatus::Available, None)?;
                continue;
            };
            let Some(task_id) = case.remote_task_id else {
                self.store.set_gpu_status(&gpu.group_name, GpuStatus::Available, None)?;
                continue;
            };

            if self.remote.kill_task(task_id).await {
                log_info!(ctx, "zombie task {task_id} finally killed, releasing gpu");
                if !case.status.is_terminal() {
                    self.store.set_case_error(case_id, "gpu reclaimed from zombie state")?;
                    self.store.update_case_completion(case_id, CaseStatus::Failed)?;
                }
                self.store.release_gpu(case_id)?;
            } else {
                log_warn!(ctx, "zombie task {task_id} still unkillable, retrying next tick");
            }
        }
        Ok(())
    }

    /// Phase 4: schedule and hand off pending cases. Stops as soon as
    /// no GPU is available rather than looping through the rest of the
    /// batch — there is nothing left to assign this tick (§4.8/§8
    /// "GPU-exhaustion defers").
    async fn phase_dispatch_submitted(&self) -> anyhow::Result<()> {
        let pending = self.store.list_cases_by_status(CaseStatus::Submitted, None)?;
        let ordered = self.scheduler.order(pending, self.batch_size);

        for case in ordered {
            let ctx = LogContext::new("supervisor_dispatch").case(case.id);

            let Some(group) = self.gpu_manager.choose_optimal().await? else {
                log_info!(ctx, "no gpu available, deferring rest of batch");
                break;
            };

            if !self.store.try_lock_gpu(case.id, &group)? {
                // Lost the race for this group to another dispatch;
                // try again next tick rather than looping here, since
                // the GPU manager's view is now stale.
                continue;
            }

            self.store.set_case_gpu_group(case.id, &group)?;
            log_info!(ctx.clone().gpu_group(group.clone()), "locked gpu, handing off to worker pool");

            if !self.worker_pool.try_dispatch(case.id) {
                log_warn!(ctx, "worker pool rejected dispatch, releasing gpu for retry");
                self.store.release_gpu(case.id)?;
            }
        }
        Ok(())
    }
}
