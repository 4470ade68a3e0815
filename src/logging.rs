// src/logging.rs
//
// Structured logging context, threaded explicitly through call sites
// rather than carried on a thread-local or a logger-instance default
// (see §9/§10.1: the supervisor never depends on implicit
// per-thread state). The `log` crate's global dispatch is still the
// transport — only the context attached to each record is explicit.

use crate::error::ErrorKind;
use std::fmt;

/// Per-call-site structured context, attached explicitly to each log
/// record rather than carried implicitly by a logger instance.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    pub case_id: Option<i64>,
    pub operation: Option<&'static str>,
    pub gpu_group: Option<String>,
    pub task_id: Option<i64>,
    pub error_category: Option<ErrorKind>,
    pub is_retryable: Option<bool>,
    /// Free-form key/value pairs beyond the named fields above, mirroring
    /// the original's `extra_data` dict (e.g. `exception_type`,
    /// `exception_details` attached at a handler's catch site).
    pub extra: Vec<(&'static str, String)>,
}

impl LogContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation: Some(operation),
            ..Default::default()
        }
    }

    pub fn case(mut self, case_id: i64) -> Self {
        self.case_id = Some(case_id);
        self
    }

    pub fn gpu_group(mut self, group: impl Into<String>) -> Self {
        self.gpu_group = Some(group.into());
        self
    }

    pub fn task(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn error(mut self, kind: ErrorKind) -> Self {
        self.error_category = Some(kind);
        self.is_retryable = Some(kind.is_retryable());
        self
    }

    /// Attaches a free-form `key=value` pair not covered by the named
    /// fields above (e.g. `exception_type`, a retry attempt count).
    pub fn with_extra(mut self, key: &'static str, value: impl ToString) -> Self {
        self.extra.push((key, value.to_string()));
        self
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        macro_rules! field {
            ($name:expr, $val:expr) => {
                if let Some(v) = $val {
                    if !first {
                        write!(f, " ")?;
                    }
                    write!(f, "{}={}", $name, v)?;
                    first = false;
                }
            };
        }
        field!("case_id", self.case_id);
        field!("op", self.operation);
        field!("gpu_group", self.gpu_group.as_ref());
        field!("task_id", self.task_id);
        field!("error_category", self.error_category);
        field!("is_retryable", self.is_retryable);
        for (key, value) in &self.extra {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        write!(f, "]")
    }
}

/// Logs at `info` level with structured context attached, prefixing
/// the usual module-scoped `log::info!` call with an explicit context
/// token instead of a free-form string.
#[macro_export]
macro_rules! log_info {
    ($ctx:expr, $($arg:tt)+) => {
        log::info!("{} {}", $ctx, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($ctx:expr, $($arg:tt)+) => {
        log::warn!("{} {}", $ctx, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_error {
    ($ctx:expr, $($arg:tt)+) => {
        log::error!("{} {}", $ctx, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_display_includes_fields() {
        let ctx = LogContext::new("dispatch").case(7).gpu_group("gpu_0");
        let rendered = ctx.to_string();
        assert!(rendered.contains("case_id=7"));
        assert!(rendered.contains("op=dispatch"));
        assert!(rendered.contains("gpu_group=gpu_0"));
    }

    #[test]
    fn extra_fields_are_rendered_alongside_named_fields() {
        let ctx = LogContext::new("submit")
            .case(7)
            .with_extra("attempt", 2)
            .with_extra("exception_type", "Timeout");
        let rendered = ctx.to_string();
        assert!(rendered.contains("case_id=7"));
        assert!(rendered.contains("attempt=2"));
        assert!(rendered.contains("exception_type=Timeout"));
    }
}
