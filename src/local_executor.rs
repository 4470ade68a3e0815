// src/local_executor.rs
//
// The Local Executor (§4.5): launches the two opaque
// external transformation tools ("interpreter" and "raw-to-dicom") as
// subprocesses, streaming stdout for the three progress markers. Logs
// the stderr tail on non-zero exit, the shape common to this
// codebase's subprocess wrappers — adapted here to stream stdout
// line-by-line concurrently with the process running, rather than
// waiting for full output, since progress markers must be observed as
// they are emitted.

use crate::error::{classify_exit_code, ExecutionError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const STDERR_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTarget {
    RunInterpreter,
    RunRaw2Dcm,
}

/// A single progress marker observed on stdout, per §4.5 step 4.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Status(String),
    Progress(u8),
    Subtask(String),
}

#[derive(Debug, Clone)]
pub struct LocalRunOutcome {
    pub return_code: i32,
    pub execution_time: Duration,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn execute(
        &self,
        target: LocalTarget,
        case_path: &Path,
        on_progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> Result<LocalRunOutcome, ExecutionError>;
}

pub struct SubprocessLocalExecutor {
    pub mqi_interpreter: Option<PathBuf>,
    pub raw2dcm: Option<PathBuf>,
}

impl SubprocessLocalExecutor {
    pub fn new(mqi_interpreter: Option<String>, raw2dcm: Option<String>) -> Self {
        Self {
            mqi_interpreter: mqi_interpreter.map(PathBuf::from),
            raw2dcm: raw2dcm.map(PathBuf::from),
        }
    }

    fn build_command(
        &self,
        target: LocalTarget,
        case_path: &Path,
    ) -> Result<Command, ExecutionError> {
        match target {
            LocalTarget::RunInterpreter => {
                let script = self
                    .mqi_interpreter
                    .as_ref()
                    .ok_or_else(|| ExecutionError::configuration("mqi_interpreter script path not configured"))?;
                if !script.exists() {
                    return Err(ExecutionError::configuration(format!(
                        "interpreter script not found: {:?}",
                        script
                    )));
                }
                let mut cmd = Command::new("python3");
                cmd.arg(script)
                    .arg("--logdir")
                    .arg(case_path)
                    .arg("--outputdir")
                    .arg(case_path);
                Ok(cmd)
            }
            LocalTarget::RunRaw2Dcm => {
                let script = self
                    .raw2dcm
                    .as_ref()
                    .ok_or_else(|| ExecutionError::configuration("raw2dcm script path not configured"))?;
                if !script.exists() {
                    return Err(ExecutionError::configuration(format!(
                        "raw2dcm script not found: {:?}",
                        script
                    )));
                }
                let raw_output_dir = case_path.join("raw_output");
                if !raw_output_dir.exists() {
                    return Err(ExecutionError::application(format!(
                        "raw output directory not found: {:?}",
                        raw_output_dir
                    )));
                }
                let output_dir = case_path.join("final_dcm");
                std::fs::create_dir_all(&output_dir)
                    .map_err(|e| ExecutionError::system(format!("failed to create final_dcm dir: {e}")))?;

                let mut cmd = Command::new("python3");
                cmd.arg(script)
                    .arg("--input")
                    .arg(&raw_output_dir)
                    .arg("--output")
                    .arg(&output_dir);
                Ok(cmd)
            }
        }
    }
}

#[async_trait]
impl LocalExecutor for SubprocessLocalExecutor {
    async fn execute(
        &self,
        target: LocalTarget,
        case_path: &Path,
        on_progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> Result<LocalRunOutcome, ExecutionError> {
        let mut cmd = self.build_command(target, case_path)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutionError::system(format!("failed to spawn local tool: {e}")))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        // Read stdout and stderr concurrently with the child running
        // (not spawned: `on_progress` is borrowed, not `'static`), so
        // each progress marker fires as soon as its line arrives rather
        // than being replayed after the process exits (§4.5 step 4).
        let stdout_reader = async {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if let Some(event) = parse_progress_marker(&line) {
                    on_progress(event);
                }
                lines.push(line);
            }
            lines
        };
        let stderr_reader = async {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                lines.push(line);
            }
            lines
        };
        let wait = child.wait();

        let (stdout_lines, stderr_lines, status) = tokio::join!(stdout_reader, stderr_reader, wait);
        let status = status.map_err(|e| ExecutionError::system(format!("local tool process error: {e}")))?;

        let execution_time = start.elapsed();
        let return_code = status.code().unwrap_or(-1);

        if !status.success() {
            let tail: Vec<&str> = stderr_lines
                .iter()
                .rev()
                .take(STDERR_TAIL_LINES)
                .map(|s| s.as_str())
                .collect();
            let kind = classify_exit_code(status.code());
            return Err(ExecutionError::new(
                kind,
                format!("local tool exited with code {return_code}"),
            )
            .with_stderr(tail.join("\n")));
        }

        Ok(LocalRunOutcome {
            return_code,
            execution_time,
            stdout_lines,
            stderr_lines,
        })
    }
}

/// Matches the three progress markers from §4.5: `STATUS:: <text>`,
/// `PROGRESS:: <0..100>`, `SUBTASK:: <text>`.
fn parse_progress_marker(line: &str) -> Option<ProgressEvent> {
    if let Some(rest) = line.strip_prefix("STATUS::") {
        return Some(ProgressEvent::Status(rest.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix("PROGRESS::") {
        return rest.trim().parse::<u8>().ok().map(|p| ProgressEvent::Progress(p.min(100)));
    }
    if let Some(rest) = line.strip_prefix("SUBTASK::") {
        return Some(ProgressEvent::Subtask(rest.trim().to_string()));
    }
    None
}
