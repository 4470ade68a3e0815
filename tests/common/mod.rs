// tests/common/mod.rs
//
// Shared fixtures for the end-to-end scenario and property tests: a
// scriptable `RemoteExecutor` stand-in whose responses a test can set
// up front, a do-nothing `LocalExecutor`, and the config/store wiring
// every scenario needs. Mirrors the fakes already used by the unit
// tests in src/worker_pool.rs and src/gpu_manager.rs, just parameterized
// instead of hardcoded, since these scenarios each need a different
// canned response.

use async_trait::async_trait;
use mqi_supervisor::config::{Config, HpcConfig, LocalToolsConfig, PrioritySchedulingConfig};
use mqi_supervisor::error::ExecutionError;
use mqi_supervisor::local_executor::{LocalExecutor, LocalRunOutcome, LocalTarget, ProgressEvent};
use mqi_supervisor::remote::executor::{RemoteCaseDirs, RemoteExecutor, TaskPollResult};
use mqi_supervisor::remote::probe::{HardwareReading, QueueSnapshot, RemoteProbe};
use mqi_supervisor::remote::TaskLookup;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub fn test_config(watch_dir: &str, db_path: &str) -> Config {
    Config {
        watch_dir: watch_dir.to_string(),
        state_db_path: db_path.to_string(),
        max_workers: 2,
        batch_size: 4,
        processing_timeout_seconds: 30,
        scan_interval_seconds: 10,
        polling_interval_seconds: 30,
        sleep_interval_seconds: 5,
        running_case_timeout_hours: 12.0,
        gpu_refresh_interval_iterations: 5,
        quiescence_period_seconds: 5,
        priority_scheduling: PrioritySchedulingConfig {
            algorithm: "strict_priority".to_string(),
            aging_factor: 0.5,
            starvation_threshold_hours: 4.0,
        },
        hpc: HpcConfig {
            user: "mqi".into(),
            host: "hpc01".into(),
            ssh_command: "ssh".into(),
            scp_command: "scp".into(),
            remote_job_manager_command: "pueue".into(),
            remote_base_dir: "/scratch/mqi".into(),
            moqui_interpreter_outputs_dir: "~/Outputs_csv".into(),
            moqui_outputs_dir: "~/Dose_raw".into(),
        },
        local_tools: LocalToolsConfig::default(),
    }
}

/// Every field defaults to the "everything succeeds instantly" case;
/// a test overwrites only the fields its scenario needs to script.
pub struct ScriptedRemote {
    pub find_task_result: Mutex<TaskLookup>,
    pub poll_result: Mutex<TaskPollResult>,
    pub kill_result: Mutex<bool>,
    pub submit_id: Mutex<i64>,
}

impl Default for ScriptedRemote {
    fn default() -> Self {
        Self {
            find_task_result: Mutex::new(TaskLookup::NotFound),
            poll_result: Mutex::new(TaskPollResult::Success),
            kill_result: Mutex::new(true),
            submit_id: Mutex::new(1),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedRemote {
    async fn ensure_remote_dirs(&self, _case_name: &str, _run_id: &str) -> Result<RemoteCaseDirs, ExecutionError> {
        Ok(RemoteCaseDirs {
            case_dir: "/scratch/mqi/case".into(),
            interpreter_outputs_dir: "/scratch/mqi/case/interp".into(),
            outputs_dir: "/scratch/mqi/case/out".into(),
        })
    }

    async fn upload_tps_file(&self, _content: &[u8], _remote_path: &str) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn upload_case_dir(&self, _local: &Path, _remote: &str) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn submit_job(&self, _remote_dir: &str, _group: &str, _label: &str) -> Result<i64, ExecutionError> {
        Ok(*self.submit_id.lock().unwrap())
    }

    async fn find_task_by_label(&self, _label: &str) -> TaskLookup {
        *self.find_task_result.lock().unwrap()
    }

    async fn poll_task_status(&self, _task_id: i64) -> TaskPollResult {
        *self.poll_result.lock().unwrap()
    }

    async fn kill_task(&self, _task_id: i64) -> bool {
        *self.kill_result.lock().unwrap()
    }

    async fn download_results(&self, _remote_dir: &str, _local_dir: &Path) -> Result<Vec<String>, ExecutionError> {
        Ok(vec![])
    }
}

/// A probe that never sees a remote host. GPU-exhaustion scenarios
/// never reach it (no available group means `choose_optimal` returns
/// before calling out), and discovery/reconcile just skip their cycle.
pub struct NullProbe;

#[async_trait]
impl RemoteProbe for NullProbe {
    async fn list_groups(&self) -> Option<BTreeSet<String>> {
        None
    }
    async fn queue_status(&self) -> Option<QueueSnapshot> {
        None
    }
    async fn hardware_usage(&self) -> Option<HashMap<usize, HardwareReading>> {
        None
    }
}

pub struct NoopLocal;

#[async_trait]
impl LocalExecutor for NoopLocal {
    async fn execute(
        &self,
        _target: LocalTarget,
        _case_path: &Path,
        _on_progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> Result<LocalRunOutcome, ExecutionError> {
        Ok(LocalRunOutcome {
            return_code: 0,
            execution_time: Duration::from_millis(1),
            stdout_lines: vec![],
            stderr_lines: vec![],
        })
    }
}

/// Counts invocations per target so a resumed run can be checked for
/// *which* steps it actually re-executed, not just its final status.
#[derive(Default)]
pub struct CountingLocal {
    pub preprocess_calls: std::sync::atomic::AtomicUsize,
    pub postprocess_calls: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl LocalExecutor for CountingLocal {
    async fn execute(
        &self,
        target: LocalTarget,
        _case_path: &Path,
        _on_progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> Result<LocalRunOutcome, ExecutionError> {
        match target {
            LocalTarget::RunInterpreter => {
                self.preprocess_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            LocalTarget::RunRaw2Dcm => {
                self.postprocess_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        Ok(LocalRunOutcome {
            return_code: 0,
            execution_time: Duration::from_millis(1),
            stdout_lines: vec![],
            stderr_lines: vec![],
        })
    }
}
