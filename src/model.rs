// src/model.rs
//
// The three entity families the State Store owns: Case, WorkflowStep,
// GpuResource. These are plain data — all mutation happens through
// `store::Store` operations (§4.1); nothing in this module
// talks to SQLite directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every status a case can hold, including the transient per-step
/// labels named in §4.6. `Submitted` is the sentinel
/// initial value written by `AddCase` and is never also a step's
/// on-success status, so the Workflow State Machine's resumption
/// algorithm (§4.6/§8 "Resumption correctness") always starts a brand
/// new case at step index 0: every *other* variant here is some step's
/// on-success status and uniquely identifies which step last completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaseStatus {
    Submitted,
    Preprocessing,
    Preprocessed,
    GeneratingTps,
    TpsGenerated,
    Uploading,
    Uploaded,
    Submitting,
    Running,
    Polled,
    Downloading,
    Downloaded,
    Postprocessing,
    Completed,
    Failed,
}

impl CaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CaseStatus::Completed | CaseStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Submitted => "submitted",
            CaseStatus::Preprocessing => "preprocessing",
            CaseStatus::Preprocessed => "preprocessed",
            CaseStatus::GeneratingTps => "generating_tps",
            CaseStatus::TpsGenerated => "tps_generated",
            CaseStatus::Uploading => "uploading",
            CaseStatus::Uploaded => "uploaded",
            CaseStatus::Submitting => "submitting",
            CaseStatus::Running => "running",
            CaseStatus::Polled => "polled",
            CaseStatus::Downloading => "downloading",
            CaseStatus::Downloaded => "downloaded",
            CaseStatus::Postprocessing => "postprocessing",
            CaseStatus::Completed => "completed",
            CaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(CaseStatus::Submitted),
            "preprocessing" => Ok(CaseStatus::Preprocessing),
            "preprocessed" => Ok(CaseStatus::Preprocessed),
            "generating_tps" => Ok(CaseStatus::GeneratingTps),
            "tps_generated" => Ok(CaseStatus::TpsGenerated),
            "uploading" => Ok(CaseStatus::Uploading),
            "uploaded" => Ok(CaseStatus::Uploaded),
            "submitting" => Ok(CaseStatus::Submitting),
            "running" => Ok(CaseStatus::Running),
            "polled" => Ok(CaseStatus::Polled),
            "downloading" => Ok(CaseStatus::Downloading),
            "downloaded" => Ok(CaseStatus::Downloaded),
            "postprocessing" => Ok(CaseStatus::Postprocessing),
            "completed" => Ok(CaseStatus::Completed),
            "failed" => Ok(CaseStatus::Failed),
            other => Err(format!("unrecognized case status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CasePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl CasePriority {
    /// Numeric weight used by both strict-priority ordering and the
    /// weighted-fair-queuing scheduler's base score.
    pub fn weight(self) -> f64 {
        match self {
            CasePriority::Low => 1.0,
            CasePriority::Normal => 2.0,
            CasePriority::High => 3.0,
            CasePriority::Urgent => 4.0,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            CasePriority::Low => 1,
            CasePriority::Normal => 2,
            CasePriority::High => 3,
            CasePriority::Urgent => 4,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            v if v <= 1 => CasePriority::Low,
            2 => CasePriority::Normal,
            3 => CasePriority::High,
            _ => CasePriority::Urgent,
        }
    }

    /// Base priority eligible for the starvation boost (§4.9): only
    /// `low` and `normal` cases age into the extra fixed boost.
    pub fn is_starvation_eligible(self) -> bool {
        matches!(self, CasePriority::Low | CasePriority::Normal)
    }
}

impl Default for CasePriority {
    fn default() -> Self {
        CasePriority::Normal
    }
}

#[derive(Debug, Clone)]
pub struct Case {
    pub id: i64,
    pub path: String,
    pub status: CaseStatus,
    pub progress: i64,
    pub priority: CasePriority,
    pub gpu_group: Option<String>,
    pub remote_task_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_error: Option<String>,
}

impl Case {
    pub fn case_name(&self) -> &str {
        std::path::Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path)
    }

    /// The stable prefix shared by every label this case could have
    /// submitted under (§4.8 Phase 1: "compute its expected label
    /// `mqic_case_<id>`"). A restarted supervisor doesn't know which
    /// attempt's epoch suffix actually landed, so recovery matches on
    /// this prefix rather than an exact label.
    pub fn recovery_label_prefix(&self) -> String {
        format!("mqic_case_{}", self.id)
    }

    /// The full label attached at submission time (§4.4: `mqic_case_<id>_<epoch_seconds>`).
    pub fn submit_label(&self, epoch_seconds: i64) -> String {
        format!("{}_{}", self.recovery_label_prefix(), epoch_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(StepStatus::Started),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(format!("unrecognized step status: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowStepRecord {
    pub case_id: i64,
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuStatus {
    Available,
    Assigned,
    Busy,
    Zombie,
}

impl GpuStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GpuStatus::Available => "available",
            GpuStatus::Assigned => "assigned",
            GpuStatus::Busy => "busy",
            GpuStatus::Zombie => "zombie",
        }
    }
}

impl fmt::Display for GpuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GpuStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(GpuStatus::Available),
            "assigned" => Ok(GpuStatus::Assigned),
            "busy" => Ok(GpuStatus::Busy),
            "zombie" => Ok(GpuStatus::Zombie),
            other => Err(format!("unrecognized gpu status: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GpuResource {
    pub group_name: String,
    pub status: GpuStatus,
    pub assigned_case_id: Option<i64>,
    pub last_updated: DateTime<Utc>,
}

/// Maps a GPU group name to the hardware indices it represents, per the
/// `gpu_<N>` naming convention in §4.7. Unrecognized names map to an
/// empty set, meaning hardware status is unknown for that group and the
/// GPU Manager must fall back to queue-status-only reasoning.
pub fn group_to_hardware_indices(group_name: &str) -> Vec<usize> {
    group_name
        .strip_prefix("gpu_")
        .and_then(|rest| rest.parse::<usize>().ok())
        .map(|idx| vec![idx])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_group_maps_to_index() {
        assert_eq!(group_to_hardware_indices("gpu_3"), vec![3]);
    }

    #[test]
    fn unrecognized_group_maps_to_empty() {
        assert_eq!(group_to_hardware_indices("alpha"), Vec::<usize>::new());
        assert_eq!(group_to_hardware_indices("gpu_x"), Vec::<usize>::new());
    }

    #[test]
    fn priority_weights_are_ordered() {
        assert!(CasePriority::High.weight() > CasePriority::Normal.weight());
        assert!(CasePriority::Normal.weight() > CasePriority::Low.weight());
    }

    #[test]
    fn status_roundtrips_through_str() {
        for s in ["submitted", "submitting", "running", "completed", "failed"] {
            let parsed: CaseStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }
}
