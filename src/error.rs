// src/error.rs
//
// Five-kind error classification shared by every executor and by the
// workflow state machine's retry policy. Each executor produces one of
// these kinds directly at the point of failure; the regex/exit-code based
// `classify` function is a fallback for errors that arrive as an opaque
// `std::io::Error` or similar from a lower layer (subprocess exit codes,
// raw OS errors) rather than having already been typed.

use std::fmt;

/// One of the five error categories a fault can be classified into.
///
/// `Network` and `System` are treated as transient and retryable;
/// `Configuration` and `Application` are not; `Unknown` is conservatively
/// treated as non-retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    System,
    Configuration,
    Application,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::System)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::System => "system",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Application => "application",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step- or executor-level failure, carrying its classification.
///
/// This is the error type threaded through the Remote Probe, Remote
/// Executor, and Local Executor: every fallible operation in those
/// modules returns `Result<T, ExecutionError>` rather than a bare
/// `anyhow::Error`, so the workflow's retry policy can match on `kind()`
/// without re-deriving it from a message string.
#[derive(Debug, thiserror::Error)]
#[error("{message} (kind={kind})")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub stderr: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stderr: None,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Fallback classifier for an SSH/SCP style subprocess exit, used only
/// when a failure could not be typed at its source (§9's design note:
/// prefer typed errors at the point of failure, use this as a fallback).
pub fn classify_exit_code(code: Option<i32>) -> ErrorKind {
    match code {
        Some(255) | Some(254) => ErrorKind::Network,
        Some(126) | Some(127) => ErrorKind::System,
        Some(2) => ErrorKind::System,
        Some(1) => ErrorKind::Application,
        _ => ErrorKind::Unknown,
    }
}

/// Fallback classifier over a stderr/message string, applied only after
/// exit-code classification declines to produce an answer.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("connection") && (lower.contains("refused") || lower.contains("reset")) {
        return ErrorKind::Network;
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return ErrorKind::Network;
    }
    if lower.contains("network") && lower.contains("unreachable") {
        return ErrorKind::Network;
    }
    if lower.contains("host") && lower.contains("unreachable") {
        return ErrorKind::Network;
    }
    if lower.contains("permission denied") || lower.contains("no such file") {
        return ErrorKind::System;
    }
    ErrorKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::System.is_retryable());
        assert!(!ErrorKind::Configuration.is_retryable());
        assert!(!ErrorKind::Application.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn exit_code_classification() {
        assert_eq!(classify_exit_code(Some(255)), ErrorKind::Network);
        assert_eq!(classify_exit_code(Some(127)), ErrorKind::System);
        assert_eq!(classify_exit_code(Some(1)), ErrorKind::Application);
        assert_eq!(classify_exit_code(None), ErrorKind::Unknown);
    }

    #[test]
    fn message_classification() {
        assert_eq!(classify_message("Connection refused"), ErrorKind::Network);
        assert_eq!(
            classify_message("ssh: connect to host timed out"),
            ErrorKind::Network
        );
        assert_eq!(
            classify_message("bash: permission denied"),
            ErrorKind::System
        );
        assert_eq!(classify_message("something odd"), ErrorKind::Unknown);
    }
}
