// src/remote/mod.rs
//
// Shared SSH/SCP plumbing for the Remote Probe and Remote Executor
// (§4.3/§4.4). Both modules are "the same host, two kinds
// of operation" (read-only queries vs. side-effecting commands) so the
// subprocess invocation helper — build an `ssh user@host <cmd>` or
// `scp ...` argv, run it under a hard timeout, classify the failure —
// lives here once.

pub mod executor;
pub mod probe;

use crate::config::HpcConfig;
use crate::error::{classify_exit_code, ErrorKind, ExecutionError};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// A task's queue status as reported by the remote job manager's
/// `status --json`, mapped per the wire contract in §4.3/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Success,
    Failure,
    Running,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLookup {
    Found(i64),
    NotFound,
    Unreachable,
}

/// Runs `ssh user@host <args...>` with a hard timeout, returning the
/// completed process output or a classified `ExecutionError`.
pub async fn run_ssh(
    hpc: &HpcConfig,
    args: &[&str],
    timeout_secs: u64,
) -> Result<Output, ExecutionError> {
    let mut cmd = Command::new(&hpc.ssh_command);
    cmd.arg(format!("{}@{}", hpc.user, hpc.host));
    cmd.args(args);
    run_with_timeout(cmd, timeout_secs).await
}

/// Runs `ssh user@host <cmd_str>` where `cmd_str` is a single shell
/// string to execute remotely (used for the remote job manager's own
/// subcommands, which already embed their own quoting).
pub async fn run_ssh_shell(
    hpc: &HpcConfig,
    shell_cmd: &str,
    timeout_secs: u64,
) -> Result<Output, ExecutionError> {
    let mut cmd = Command::new(&hpc.ssh_command);
    cmd.arg(format!("{}@{}", hpc.user, hpc.host));
    cmd.arg(shell_cmd);
    run_with_timeout(cmd, timeout_secs).await
}

pub async fn run_ssh_with_stdin(
    hpc: &HpcConfig,
    shell_cmd: &str,
    stdin_data: &[u8],
    timeout_secs: u64,
) -> Result<Output, ExecutionError> {
    use tokio::io::AsyncWriteExt;
    use std::process::Stdio;

    let mut cmd = Command::new(&hpc.ssh_command);
    cmd.arg(format!("{}@{}", hpc.user, hpc.host));
    cmd.arg(shell_cmd);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecutionError::system(format!("failed to spawn ssh: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(stdin_data)
            .await
            .map_err(|e| ExecutionError::network(format!("failed writing to ssh stdin: {e}")))?;
    }

    let wait = timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await;
    match wait {
        Ok(Ok(output)) => classify_output(output),
        Ok(Err(e)) => Err(ExecutionError::system(format!("ssh process error: {e}"))),
        Err(_) => Err(ExecutionError::network(format!(
            "ssh timed out after {timeout_secs}s"
        ))),
    }
}

pub async fn run_scp(args: &[String], scp_cmd: &str, timeout_secs: u64) -> Result<Output, ExecutionError> {
    let mut cmd = Command::new(scp_cmd);
    cmd.args(args);
    run_with_timeout(cmd, timeout_secs).await
}

async fn run_with_timeout(mut cmd: Command, timeout_secs: u64) -> Result<Output, ExecutionError> {
    let run = timeout(Duration::from_secs(timeout_secs), cmd.output());
    match run.await {
        Ok(Ok(output)) => classify_output(output),
        Ok(Err(e)) => Err(ExecutionError::system(format!("failed to launch subprocess: {e}"))),
        Err(_) => Err(ExecutionError::network(format!(
            "remote operation timed out after {timeout_secs}s"
        ))),
    }
}

fn classify_output(output: Output) -> Result<Output, ExecutionError> {
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let kind = classify_exit_code(output.status.code());
        let kind = if kind == ErrorKind::Unknown {
            crate::error::classify_message(&stderr)
        } else {
            kind
        };
        Err(ExecutionError::new(
            kind,
            format!("remote command exited with status {:?}", output.status.code()),
        )
        .with_stderr(stderr))
    }
}

/// Normalizes a local path for transfer to a POSIX remote host:
/// backslashes become forward slashes (Windows-originated paths), and a
/// leading `~/` is stripped since `scp`'s destination argument does not
/// always expand tildes the way an interactive shell would (§4.4).
pub fn normalize_remote_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized
        .strip_prefix("~/")
        .map(|s| s.to_string())
        .unwrap_or(normalized)
}
