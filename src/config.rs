// src/config.rs
//
// Configuration layer. Config-file *parsing* is named as an external
// concern in §1, but the typed config struct it deserializes
// into is ambient infrastructure this crate owns (§10.3): a `serde_yaml`
// deserialization target with a default for every optional knob, so a
// minimal config file only needs to override what it cares about.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub watch_dir: String,
    pub state_db_path: String,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_processing_timeout_seconds")]
    pub processing_timeout_seconds: u64,
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,
    #[serde(default = "default_polling_interval_seconds")]
    pub polling_interval_seconds: u64,
    #[serde(default = "default_sleep_interval_seconds")]
    pub sleep_interval_seconds: u64,
    #[serde(default = "default_running_case_timeout_hours")]
    pub running_case_timeout_hours: f64,
    #[serde(default = "default_gpu_refresh_interval_iterations")]
    pub gpu_refresh_interval_iterations: u64,
    #[serde(default = "default_quiescence_period_seconds")]
    pub quiescence_period_seconds: u64,

    #[serde(default)]
    pub priority_scheduling: PrioritySchedulingConfig,

    pub hpc: HpcConfig,

    #[serde(default)]
    pub local_tools: LocalToolsConfig,
}

fn default_max_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    4
}
fn default_processing_timeout_seconds() -> u64 {
    1800
}
fn default_scan_interval_seconds() -> u64 {
    10
}
fn default_polling_interval_seconds() -> u64 {
    30
}
fn default_sleep_interval_seconds() -> u64 {
    5
}
fn default_running_case_timeout_hours() -> f64 {
    12.0
}
fn default_gpu_refresh_interval_iterations() -> u64 {
    5
}
fn default_quiescence_period_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrioritySchedulingConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_aging_factor")]
    pub aging_factor: f64,
    #[serde(default = "default_starvation_threshold_hours")]
    pub starvation_threshold_hours: f64,
}

impl Default for PrioritySchedulingConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            aging_factor: default_aging_factor(),
            starvation_threshold_hours: default_starvation_threshold_hours(),
        }
    }
}

fn default_algorithm() -> String {
    "strict_priority".to_string()
}
fn default_aging_factor() -> f64 {
    0.5
}
fn default_starvation_threshold_hours() -> f64 {
    4.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct HpcConfig {
    pub user: String,
    pub host: String,
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
    #[serde(default = "default_scp_command")]
    pub scp_command: String,
    #[serde(default = "default_remote_job_manager_command")]
    pub remote_job_manager_command: String,
    pub remote_base_dir: String,
    #[serde(default = "default_interpreter_outputs_dir")]
    pub moqui_interpreter_outputs_dir: String,
    #[serde(default = "default_outputs_dir")]
    pub moqui_outputs_dir: String,
}

fn default_ssh_command() -> String {
    "ssh".to_string()
}
fn default_scp_command() -> String {
    "scp".to_string()
}
fn default_remote_job_manager_command() -> String {
    "pueue".to_string()
}
fn default_interpreter_outputs_dir() -> String {
    "~/Outputs_csv".to_string()
}
fn default_outputs_dir() -> String {
    "~/Dose_raw".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocalToolsConfig {
    pub mqi_interpreter: Option<String>,
    pub raw2dcm: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.watch_dir.trim().is_empty() {
            anyhow::bail!("watch_dir must not be empty");
        }
        if self.state_db_path.trim().is_empty() {
            anyhow::bail!("state_db_path must not be empty");
        }
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        if self.hpc.user.trim().is_empty() || self.hpc.host.trim().is_empty() {
            anyhow::bail!("hpc.user and hpc.host are required");
        }
        Ok(())
    }
}
