// src/tps.rs
//
// TPS parameter-file generation (§4.6/§9): a pure function
// with no dependency on the Remote Executor, breaking what would
// otherwise be a cyclic dependency between the workflow state machine
// and the executor. The workflow state machine calls
// `build_tps_content` directly and hands the resulting bytes to the
// executor's `upload_tps_file` as an opaque blob.

use crate::config::Config;
use crate::model::Case;

/// The file name the remote case directory expects (§6).
pub const TPS_FILE_NAME: &str = "moqui_tps.in";

/// Plan geometry extracted from the case's RT plan DICOM file. Out of
/// scope as a feature (§1/§6) — this crate depends only on this narrow
/// shape, produced by a real DICOM parser elsewhere.
#[derive(Debug, Clone, Default)]
pub struct PlanInfo {
    pub beam_numbers: Vec<u32>,
    pub dose_grid_reference: Option<String>,
}

/// Narrow trait the workflow depends on in place of a real DICOM
/// parser (§6): `find_rtplan_file` locates the plan file in a case
/// directory, `get_plan_info` extracts the handful of fields
/// `build_tps_content` needs. A stub returning `None`/defaults is
/// sufficient to keep the workflow compiling and testable.
pub trait PlanInfoProvider: Send + Sync {
    fn find_rtplan_file(&self, case_path: &std::path::Path) -> Option<std::path::PathBuf>;
    fn get_plan_info(&self, rtplan_path: &std::path::Path) -> Option<PlanInfo>;
}

/// Returns `None` unconditionally: logs and continues with defaults
/// when plan extraction fails or no real DICOM parser is wired in.
pub struct NoopPlanInfoProvider;

impl PlanInfoProvider for NoopPlanInfoProvider {
    fn find_rtplan_file(&self, _case_path: &std::path::Path) -> Option<std::path::PathBuf> {
        None
    }

    fn get_plan_info(&self, _rtplan_path: &std::path::Path) -> Option<PlanInfo> {
        None
    }
}

/// Resolves plan info for a case, falling back to defaults if no
/// RT plan file can be found or parsed.
pub fn resolve_plan_info(provider: &dyn PlanInfoProvider, case_path: &std::path::Path) -> PlanInfo {
    provider
        .find_rtplan_file(case_path)
        .and_then(|path| provider.get_plan_info(&path))
        .unwrap_or_default()
}

/// Builds the `moqui_tps.in` content for a case: a plain-text
/// `key value` file with, at minimum, `GPUID`, `DicomDir`,
/// `logFilePath`, `OutputDir`, `BeamNumbers` (§6). Pure: no I/O, no
/// dependency on the Remote Executor.
pub fn build_tps_content(case: &Case, plan_info: &PlanInfo, config: &Config) -> Vec<u8> {
    let gpu_id = case
        .gpu_group
        .as_deref()
        .and_then(|g| crate::model::group_to_hardware_indices(g).into_iter().next())
        .unwrap_or(0);

    let case_name = case.case_name();
    let dicom_dir = format!("{}/{}", case.path, "dicom");
    let log_file_path = format!(
        "{}/{}/moqui.log",
        config.hpc.remote_base_dir, case_name
    );
    let output_dir = format!("{}/{}", config.hpc.moqui_outputs_dir, case_name);

    let beam_numbers = if plan_info.beam_numbers.is_empty() {
        "ALL".to_string()
    } else {
        plan_info
            .beam_numbers
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };

    let mut lines = vec![
        format!("GPUID {gpu_id}"),
        format!("DicomDir {dicom_dir}"),
        format!("logFilePath {log_file_path}"),
        format!("OutputDir {output_dir}"),
        format!("BeamNumbers {beam_numbers}"),
    ];

    if let Some(dose_grid) = &plan_info.dose_grid_reference {
        lines.push(format!("DoseGridReference {dose_grid}"));
    }

    lines.push(String::new());
    lines.join("\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HpcConfig, LocalToolsConfig, PrioritySchedulingConfig};
    use crate::model::{CasePriority, CaseStatus};
    use chrono::Utc;

    fn test_config() -> Config {
        Config {
            watch_dir: "/data/cases".into(),
            state_db_path: "/data/state.db".into(),
            max_workers: 4,
            batch_size: 4,
            processing_timeout_seconds: 1800,
            scan_interval_seconds: 10,
            polling_interval_seconds: 30,
            sleep_interval_seconds: 5,
            running_case_timeout_hours: 12.0,
            gpu_refresh_interval_iterations: 5,
            quiescence_period_seconds: 5,
            priority_scheduling: PrioritySchedulingConfig::default(),
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

    fn test_case() -> Case {
        Case {
            id: 7,
            path: "/data/cases/A".into(),
            status: CaseStatus::Submitting,
            progress: 10,
            priority: CasePriority::Normal,
            gpu_group: Some("gpu_2".into()),
            remote_task_id: None,
            created_at: Utc::now(),
            status_updated_at: Utc::now(),
            completed_at: None,
            final_error: None,
        }
    }

    #[test]
    fn contains_minimum_required_keys() {
        let content = String::from_utf8(build_tps_content(
            &test_case(),
            &PlanInfo::default(),
            &test_config(),
        ))
        .unwrap();
        for key in ["GPUID", "DicomDir", "logFilePath", "OutputDir", "BeamNumbers"] {
            assert!(content.contains(key), "missing key {key}");
        }
    }

    #[test]
    fn gpu_id_derived_from_group_name() {
        let content = String::from_utf8(build_tps_content(
            &test_case(),
            &PlanInfo::default(),
            &test_config(),
        ))
        .unwrap();
        assert!(content.contains("GPUID 2"));
    }

    #[test]
    fn beam_numbers_default_to_all_without_plan_info() {
        let content = String::from_utf8(build_tps_content(
            &test_case(),
            &PlanInfo::default(),
            &test_config(),
        ))
        .unwrap();
        assert!(content.contains("BeamNumbers ALL"));
    }

    #[test]
    fn beam_numbers_joined_when_present() {
        let plan_info = PlanInfo {
            beam_numbers: vec![1, 2, 3],
            dose_grid_reference: Some("grid-1".into()),
        };
        let content =
            String::from_utf8(build_tps_content(&test_case(), &plan_info, &test_config())).unwrap();
        assert!(content.contains("BeamNumbers 1,2,3"));
        assert!(content.contains("DoseGridReference grid-1"));
    }
}
