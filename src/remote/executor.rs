// src/remote/executor.rs
//
// The Remote Executor (§4.4): side-effecting wire-level
// operations on the remote host. Builds SSH/SCP argv directly, parses
// the `(id: N)` submit response, and applies a 5-minute upload/download
// timeout — restructured around the cyclic-dependency break from §9:
// `UploadTPSFile` takes pre-built bytes rather than reaching back into
// the workflow for case metadata.

use super::{normalize_remote_path, run_scp, run_ssh, run_ssh_with_stdin, TaskLookup};
use crate::config::HpcConfig;
use crate::error::ExecutionError;
use crate::remote::probe::RemoteProbe;
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;

/// `EnsureRemoteDirs`, `UploadTPSFile`, `UploadCaseDir`, `SubmitJob`,
/// `FindTaskByLabel`, `PollTaskStatus`, `KillTask`, `DownloadResults` —
/// the full side-effecting contract from §4.4.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn ensure_remote_dirs(
        &self,
        case_name: &str,
        run_id: &str,
    ) -> Result<RemoteCaseDirs, ExecutionError>;

    async fn upload_tps_file(&self, content: &[u8], remote_path: &str) -> Result<(), ExecutionError>;

    async fn upload_case_dir(&self, local: &Path, remote: &str) -> Result<(), ExecutionError>;

    async fn submit_job(
        &self,
        remote_dir: &str,
        group: &str,
        label: &str,
    ) -> Result<i64, ExecutionError>;

    /// `label` is the recovery prefix (`mqic_case_<id>`, no epoch
    /// suffix) computed from the case id alone — the exact label a
    /// prior attempt submitted under, epoch suffix included, isn't known
    /// to a restarted process, so the match is by prefix.
    async fn find_task_by_label(&self, label: &str) -> TaskLookup;

    async fn poll_task_status(&self, task_id: i64) -> TaskPollResult;

    async fn kill_task(&self, task_id: i64) -> bool;

    async fn download_results(
        &self,
        remote_dir: &str,
        local_dir: &Path,
    ) -> Result<Vec<String>, ExecutionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPollResult {
    Success,
    Failure,
    Running,
    NotFound,
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct RemoteCaseDirs {
    pub case_dir: String,
    pub interpreter_outputs_dir: String,
    pub outputs_dir: String,
}

pub struct SshRemoteExecutor {
    hpc: HpcConfig,
    probe: Box<dyn RemoteProbe>,
}

impl SshRemoteExecutor {
    pub fn new(hpc: HpcConfig, probe: Box<dyn RemoteProbe>) -> Self {
        Self { hpc, probe }
    }

    fn remote_case_dir(&self, case_name: &str, run_id: &str) -> String {
        format!("{}/{}/{}", self.hpc.remote_base_dir, case_name, run_id)
    }
}

#[async_trait]
impl RemoteExecutor for SshRemoteExecutor {
    async fn ensure_remote_dirs(
        &self,
        case_name: &str,
        run_id: &str,
    ) -> Result<RemoteCaseDirs, ExecutionError> {
        let dirs = RemoteCaseDirs {
            case_dir: self.remote_case_dir(case_name, run_id),
            interpreter_outputs_dir: format!(
                "{}/{}",
                self.hpc.moqui_interpreter_outputs_dir, case_name
            ),
            outputs_dir: format!("{}/{}", self.hpc.moqui_outputs_dir, case_name),
        };

        for dir in [&dirs.case_dir, &dirs.interpreter_outputs_dir, &dirs.outputs_dir] {
            let cmd = format!("mkdir -p {}", shell_quote(dir));
            run_ssh(&self.hpc, &[&cmd], 30).await?;
        }

        Ok(dirs)
    }

    async fn upload_tps_file(&self, content: &[u8], remote_path: &str) -> Result<(), ExecutionError> {
        let cmd = format!("cat > {}", shell_quote(remote_path));
        run_ssh_with_stdin(&self.hpc, &cmd, content, 60).await?;
        Ok(())
    }

    async fn upload_case_dir(&self, local: &Path, remote: &str) -> Result<(), ExecutionError> {
        let local_str = local.to_string_lossy().replace('\\', "/");
        let remote_for_scp = normalize_remote_path(remote);
        let args = vec![
            "-r".to_string(),
            local_str,
            format!("{}@{}:{}", self.hpc.user, self.hpc.host, remote_for_scp),
        ];
        run_scp(&args, &self.hpc.scp_command, 300).await?;
        Ok(())
    }

    async fn submit_job(
        &self,
        remote_dir: &str,
        group: &str,
        label: &str,
    ) -> Result<i64, ExecutionError> {
        let inner = format!("cd {} && ~/tps_env/.tps_env", shell_quote(remote_dir));
        let cmd = format!(
            "{} add --label {} --group {} -- sh -c {}",
            self.hpc.remote_job_manager_command,
            shell_quote(label),
            shell_quote(group),
            shell_quote(&inner),
        );
        let output = run_ssh(&self.hpc, &[&cmd], 60).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_submit_id(&stdout)
            .ok_or_else(|| ExecutionError::new(crate::error::ErrorKind::Unknown, format!("could not parse task id from submit response: {stdout}")))
    }

    async fn find_task_by_label(&self, label: &str) -> TaskLookup {
        let Some(snapshot) = self.probe.queue_status().await else {
            return TaskLookup::Unreachable;
        };
        for (id, (_, task_label)) in snapshot.tasks.iter() {
            if task_label.as_deref().is_some_and(|l| l.starts_with(label)) {
                return TaskLookup::Found(*id);
            }
        }
        TaskLookup::NotFound
    }

    async fn poll_task_status(&self, task_id: i64) -> TaskPollResult {
        let Some(snapshot) = self.probe.queue_status().await else {
            return TaskPollResult::Unreachable;
        };
        match snapshot.tasks.get(&task_id) {
            None => TaskPollResult::NotFound,
            Some((super::QueueStatus::Success, _)) => TaskPollResult::Success,
            Some((super::QueueStatus::Failure, _)) => TaskPollResult::Failure,
            Some((super::QueueStatus::Running, _)) => TaskPollResult::Running,
            Some((super::QueueStatus::NotFound, _)) => TaskPollResult::NotFound,
        }
    }

    async fn kill_task(&self, task_id: i64) -> bool {
        let cmd = format!("{} kill {}", self.hpc.remote_job_manager_command, task_id);
        run_ssh(&self.hpc, &[&cmd], 30).await.is_ok()
    }

    async fn download_results(
        &self,
        remote_dir: &str,
        local_dir: &Path,
    ) -> Result<Vec<String>, ExecutionError> {
        let local_output_dir = local_dir.join("raw_output");
        std::fs::create_dir_all(&local_output_dir)
            .map_err(|e| ExecutionError::system(format!("failed to create raw_output dir: {e}")))?;

        let remote_glob = format!("{remote_dir}/*");
        let args = vec![
            "-r".to_string(),
            format!("{}@{}:{}", self.hpc.user, self.hpc.host, remote_glob),
            local_output_dir.to_string_lossy().to_string(),
        ];
        run_scp(&args, &self.hpc.scp_command, 300).await?;

        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&local_output_dir) {
            for entry in entries.flatten() {
                files.push(entry.path().to_string_lossy().to_string());
            }
        }
        Ok(files)
    }
}

fn parse_submit_id(stdout: &str) -> Option<i64> {
    let re = Regex::new(r"\(id:\s*(\d+)\)").ok()?;
    re.captures(stdout)?.get(1)?.as_str().parse().ok()
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_submit_response_id() {
        assert_eq!(parse_submit_id("New task added (id: 42)."), Some(42));
        assert_eq!(parse_submit_id("no id here"), None);
    }

    #[test]
    fn shell_quoting_handles_embedded_quote() {
        assert_eq!(shell_quote("O'Brien"), r"'O'\''Brien'");
    }
}
