// src/workflow.rs
//
// The Workflow State Machine (§4.6): the ordered sequence
// of steps a case passes through, `preprocess → generate-tps → upload
// → submit → poll → download → postprocess`, each with an on-start, an
// on-success, and an on-failure case status plus a retry policy.
// Built around an explicit, config-driven step list rather than a DAG
// of physics jobs, per §9's design note on breaking the cyclic
// dependency between the workflow and the remote executor:
// `generate-tps` calls the pure `tps::build_tps_content` function and
// hands the executor only bytes.

use crate::config::Config;
use crate::error::{ErrorKind, ExecutionError};
use crate::local_executor::{LocalExecutor, LocalTarget, ProgressEvent};
use crate::logging::LogContext;
use crate::model::{Case, CaseStatus, StepStatus};
use crate::remote::executor::{RemoteExecutor, TaskPollResult};
use crate::store::Store;
use crate::tps::{self, PlanInfoProvider};
use crate::{log_error, log_info, log_warn};
use anyhow::Result;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Whether a step's executor lives in-process (subprocess launch) or
/// reaches the remote HPC host over SSH (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Local,
    Remote,
}

/// `preprocess | generate-tps | upload | submit | poll | download |
/// postprocess` (§4.6) — the concrete operation a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTarget {
    Preprocess,
    GenerateTps,
    Upload,
    Submit,
    Poll,
    Download,
    Postprocess,
}

impl StepTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            StepTarget::Preprocess => "preprocess",
            StepTarget::GenerateTps => "generate-tps",
            StepTarget::Upload => "upload",
            StepTarget::Submit => "submit",
            StepTarget::Poll => "poll",
            StepTarget::Download => "download",
            StepTarget::Postprocess => "postprocess",
        }
    }
}

/// `{max_attempts, delay_seconds, retryable_error_kinds}` (§4.6). A
/// `max_attempts` of 0 is folded to 1 (§8 boundary: "single attempt").
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_seconds: u64,
    pub retryable_error_kinds: Vec<ErrorKind>,
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn allows(&self, kind: ErrorKind) -> bool {
        self.retryable_error_kinds.contains(&kind)
    }

    fn fixed(max_attempts: u32, delay_seconds: u64) -> Self {
        Self {
            max_attempts,
            delay_seconds,
            retryable_error_kinds: vec![ErrorKind::Network, ErrorKind::System],
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub name: &'static str,
    pub kind: StepKind,
    pub target: StepTarget,
    pub on_start_status: CaseStatus,
    pub on_success_status: CaseStatus,
    pub on_failure_status: CaseStatus,
    pub start_progress: i64,
    pub retry: RetryPolicy,
}

/// The documented default step list (§9 Open Question: "treat the
/// sequence {preprocess, generate-tps, upload, submit, poll, download,
/// postprocess} as the documented default"). `on_success_status` is
/// distinct per step by construction — that uniqueness is what makes
/// resumption well-defined (§8 "Resumption correctness").
pub fn default_steps(polling_interval_seconds: u64) -> Vec<StepDefinition> {
    vec![
        StepDefinition {
            name: "preprocess",
            kind: StepKind::Local,
            target: StepTarget::Preprocess,
            on_start_status: CaseStatus::Preprocessing,
            on_success_status: CaseStatus::Preprocessed,
            on_failure_status: CaseStatus::Failed,
            start_progress: 5,
            retry: RetryPolicy::fixed(3, 10),
        },
        StepDefinition {
            name: "generate-tps",
            kind: StepKind::Local,
            target: StepTarget::GenerateTps,
            on_start_status: CaseStatus::GeneratingTps,
            on_success_status: CaseStatus::TpsGenerated,
            on_failure_status: CaseStatus::Failed,
            start_progress: 15,
            retry: RetryPolicy::fixed(3, 5),
        },
        StepDefinition {
            name: "upload",
            kind: StepKind::Remote,
            target: StepTarget::Upload,
            on_start_status: CaseStatus::Uploading,
            on_success_status: CaseStatus::Uploaded,
            on_failure_status: CaseStatus::Failed,
            start_progress: 25,
            retry: RetryPolicy::fixed(3, 15),
        },
        StepDefinition {
            name: "submit",
            kind: StepKind::Remote,
            target: StepTarget::Submit,
            on_start_status: CaseStatus::Submitting,
            on_success_status: CaseStatus::Running,
            on_failure_status: CaseStatus::Failed,
            start_progress: 35,
            retry: RetryPolicy::fixed(3, 15),
        },
        StepDefinition {
            name: "poll",
            kind: StepKind::Remote,
            target: StepTarget::Poll,
            on_start_status: CaseStatus::Running,
            on_success_status: CaseStatus::Polled,
            on_failure_status: CaseStatus::Failed,
            start_progress: 40,
            // Polling retries effectively forever at the configured
            // cadence; the worker pool's per-case processing timeout
            // (not this retry policy) is what bounds how long a single
            // worker stays attached to a case (§4.10/§5).
            retry: RetryPolicy {
                max_attempts: u32::MAX,
                delay_seconds: polling_interval_seconds,
                retryable_error_kinds: vec![ErrorKind::Network],
            },
        },
        StepDefinition {
            name: "download",
            kind: StepKind::Remote,
            target: StepTarget::Download,
            on_start_status: CaseStatus::Downloading,
            on_success_status: CaseStatus::Downloaded,
            on_failure_status: CaseStatus::Failed,
            start_progress: 70,
            retry: RetryPolicy::fixed(3, 15),
        },
        StepDefinition {
            name: "postprocess",
            kind: StepKind::Local,
            target: StepTarget::Postprocess,
            on_start_status: CaseStatus::Postprocessing,
            on_success_status: CaseStatus::Completed,
            on_failure_status: CaseStatus::Failed,
            start_progress: 85,
            retry: RetryPolicy::fixed(3, 10),
        },
    ]
}

/// Resumption algorithm (§4.6/§8): a pure function of the step list and
/// the case's current status. Walks the steps in order; the first step
/// whose `on_success_status` matches `status` means execution resumes
/// at `index + 1`. Failing that, falls back to the first step (in list
/// order) whose `on_failure_status` matches. Otherwise starts at 0.
pub fn resume_index(steps: &[StepDefinition], status: CaseStatus) -> usize {
    let mut status_to_step: HashMap<CaseStatus, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        status_to_step.entry(step.on_failure_status).or_insert(i);
        if step.on_success_status == status {
            return (i + 1).min(steps.len());
        }
    }
    status_to_step.get(&status).copied().unwrap_or(0)
}

/// An 8-character random token used as a remote/local sub-directory
/// name per attempt, so retries never collide with a prior attempt's
/// artifacts (§4.6, glossary "Run id").
pub fn generate_run_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Wires together everything a case's workflow run needs: the state
/// store, the two side-effecting executors, and the plan-info
/// collaborator the TPS generator depends on (§9/§6).
pub struct WorkflowStateMachine {
    store: Arc<Store>,
    remote: Arc<dyn RemoteExecutor>,
    local: Arc<dyn LocalExecutor>,
    plan_info: Arc<dyn PlanInfoProvider>,
    config: Arc<Config>,
    steps: Vec<StepDefinition>,
}

impl WorkflowStateMachine {
    pub fn new(
        store: Arc<Store>,
        remote: Arc<dyn RemoteExecutor>,
        local: Arc<dyn LocalExecutor>,
        plan_info: Arc<dyn PlanInfoProvider>,
        config: Arc<Config>,
    ) -> Self {
        let steps = default_steps(config.polling_interval_seconds);
        Self {
            store,
            remote,
            local,
            plan_info,
            config,
            steps,
        }
    }

    /// Runs a case from wherever it last left off through to a terminal
    /// state (or until an unretryable failure, or the caller's own
    /// outer timeout aborts this future — §4.10/§5).
    pub async fn run_case(&self, case_id: i64) -> Result<()> {
        let mut case = self
            .store
            .get_case(case_id)?
            .ok_or_else(|| anyhow::anyhow!("case {case_id} not found"))?;

        let mut index = resume_index(&self.steps, case.status);

        while index < self.steps.len() {
            let step = self.steps[index].clone();
            case = self.run_step(&case, &step).await?;
            if case.status.is_terminal() {
                return Ok(());
            }
            index += 1;
        }
        Ok(())
    }

    async fn run_step(&self, case: &Case, step: &StepDefinition) -> Result<Case> {
        let ctx = LogContext::new("workflow_step").case(case.id);
        let mut run_id = generate_run_id();
        let mut attempt = 0u32;

        self.store
            .record_workflow_step(case.id, step.name, StepStatus::Started, None)?;
        self.store
            .update_case_status(case.id, step.on_start_status, step.start_progress)?;

        loop {
            attempt += 1;
            log_info!(ctx, "step={} attempt={} run_id={}", step.name, attempt, run_id);

            match self.execute(case, step, &run_id).await {
                Ok(()) => {
                    self.store
                        .record_workflow_step(case.id, step.name, StepStatus::Completed, None)?;
                    if step.on_success_status.is_terminal() {
                        self.store.update_case_completion(case.id, step.on_success_status)?;
                    } else {
                        self.store
                            .update_case_status(case.id, step.on_success_status, step.start_progress)?;
                    }
                    return Ok(self
                        .store
                        .get_case(case.id)?
                        .ok_or_else(|| anyhow::anyhow!("case {} vanished mid-step", case.id))?);
                }
                Err(err) => {
                    let retryable = err.is_retryable() && step.retry.allows(err.kind);
                    if retryable && attempt < step.retry.attempts() {
                        log_warn!(
                            ctx.clone().error(err.kind).with_extra("attempt", attempt),
                            "step={} attempt={} retrying in {}s: {}",
                            step.name,
                            attempt,
                            step.retry.delay_seconds,
                            err.message
                        );
                        tokio::time::sleep(Duration::from_secs(step.retry.delay_seconds)).await;
                        run_id = generate_run_id();
                        continue;
                    }

                    log_error!(
                        ctx.clone().error(err.kind).with_extra("attempt", attempt),
                        "step={} failed terminally: {}",
                        step.name,
                        err.message
                    );
                    self.store.record_workflow_step(
                        case.id,
                        step.name,
                        StepStatus::Failed,
                        Some(&err.message),
                    )?;
                    self.store.set_case_error(case.id, &err.message)?;
                    self.store
                        .update_case_completion(case.id, CaseStatus::Failed)?;
                    return Ok(self
                        .store
                        .get_case(case.id)?
                        .ok_or_else(|| anyhow::anyhow!("case {} vanished mid-step", case.id))?);
                }
            }
        }
    }

    async fn execute(&self, case: &Case, step: &StepDefinition, run_id: &str) -> Result<(), ExecutionError> {
        match step.target {
            StepTarget::Preprocess => self.run_preprocess(case).await,
            StepTarget::GenerateTps => self.run_generate_tps(case).await,
            StepTarget::Upload => self.run_upload(case, run_id).await,
            StepTarget::Submit => self.run_submit(case, run_id).await,
            StepTarget::Poll => self.run_poll(case).await,
            StepTarget::Download => self.run_download(case).await,
            StepTarget::Postprocess => self.run_postprocess(case).await,
        }
    }

    async fn run_preprocess(&self, case: &Case) -> Result<(), ExecutionError> {
        let case_path = PathBuf::from(&case.path);
        let intermediate_dir = case_path.join("intermediate");
        std::fs::create_dir_all(&intermediate_dir)
            .map_err(|e| ExecutionError::system(format!("failed to create intermediate dir: {e}")))?;

        let ctx = LogContext::new("local_preprocess").case(case.id);
        let on_progress = |event: ProgressEvent| log_progress_event(&ctx, &event);
        self.local
            .execute(LocalTarget::RunInterpreter, &case_path, &on_progress)
            .await?;
        Ok(())
    }

    async fn run_generate_tps(&self, case: &Case) -> Result<(), ExecutionError> {
        let case_path = PathBuf::from(&case.path);
        let plan_info = tps::resolve_plan_info(self.plan_info.as_ref(), &case_path);
        let content = tps::build_tps_content(case, &plan_info, &self.config);
        std::fs::write(
            case_path.join("intermediate").join(tps::TPS_FILE_NAME),
            &content,
        )
        .map_err(|e| ExecutionError::system(format!("failed to write tps file: {e}")))?;
        Ok(())
    }

    async fn run_upload(&self, case: &Case, run_id: &str) -> Result<(), ExecutionError> {
        let case_name = case.case_name();
        let dirs = self.remote.ensure_remote_dirs(case_name, run_id).await?;

        let tps_path = PathBuf::from(&case.path)
            .join("intermediate")
            .join(tps::TPS_FILE_NAME);
        let tps_content = std::fs::read(&tps_path)
            .map_err(|e| ExecutionError::system(format!("failed to read generated tps file: {e}")))?;
        let remote_tps_path = format!("{}/{}", dirs.case_dir, tps::TPS_FILE_NAME);
        self.remote
            .upload_tps_file(&tps_content, &remote_tps_path)
            .await?;

        self.remote
            .upload_case_dir(&PathBuf::from(&case.path), &dirs.case_dir)
            .await?;
        Ok(())
    }

    async fn run_submit(&self, case: &Case, _run_id: &str) -> Result<(), ExecutionError> {
        let group = case
            .gpu_group
            .as_deref()
            .ok_or_else(|| ExecutionError::application("submit step requires an assigned gpu group"))?;
        let case_name = case.case_name();
        let remote_dir = format!("{}/{}", self.config.hpc.remote_base_dir, case_name);
        let label = case.submit_label(chrono::Utc::now().timestamp());

        let task_id = self.remote.submit_job(&remote_dir, group, &label).await?;
        self.store
            .set_case_remote_task_id(case.id, task_id)
            .map_err(|e| ExecutionError::system(e.to_string()))?;
        Ok(())
    }

    async fn run_poll(&self, case: &Case) -> Result<(), ExecutionError> {
        let task_id = case
            .remote_task_id
            .ok_or_else(|| ExecutionError::application("poll step requires a remote task id"))?;
        match self.remote.poll_task_status(task_id).await {
            TaskPollResult::Success => Ok(()),
            TaskPollResult::Running => Err(ExecutionError::network("remote task still running")),
            TaskPollResult::Failure => Err(ExecutionError::application("remote task failed")),
            TaskPollResult::NotFound => Err(ExecutionError::application("remote task not found")),
            TaskPollResult::Unreachable => Err(ExecutionError::network("remote probe unreachable")),
        }
    }

    async fn run_download(&self, case: &Case) -> Result<(), ExecutionError> {
        let case_name = case.case_name();
        let remote_dir = format!("{}/{}", self.config.hpc.moqui_outputs_dir, case_name);
        self.remote
            .download_results(&remote_dir, &PathBuf::from(&case.path))
            .await?;
        Ok(())
    }

    async fn run_postprocess(&self, case: &Case) -> Result<(), ExecutionError> {
        let case_path = PathBuf::from(&case.path);
        let ctx = LogContext::new("local_postprocess").case(case.id);
        let on_progress = |event: ProgressEvent| log_progress_event(&ctx, &event);
        self.local
            .execute(LocalTarget::RunRaw2Dcm, &case_path, &on_progress)
            .await?;
        Ok(())
    }
}

/// Surfaces a subprocess progress marker (§4.5 step 4) as a structured log
/// line under the step's own context, rather than discarding it — these
/// markers are the only visibility into what the opaque local tool is doing
/// mid-step, since case-level progress only moves at step granularity.
fn log_progress_event(ctx: &LogContext, event: &ProgressEvent) {
    match event {
        ProgressEvent::Status(text) => log_info!(ctx.clone(), "status: {}", text),
        ProgressEvent::Progress(pct) => log_info!(ctx.clone(), "progress: {}%", pct),
        ProgressEvent::Subtask(text) => log_info!(ctx.clone(), "subtask: {}", text),
    }
}
