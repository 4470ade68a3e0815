// src/remote/probe.rs
//
// The Remote Probe (§4.3): three read-only SSH queries.
// Every failure mode — bad exit code, malformed JSON, a hung connection
// past the timeout — folds into `Unreachable`. Callers must never treat
// `Unreachable` as evidence that groups don't exist or that a task
// failed; it is pure "no information this tick" per §4.3/§7.

use super::{run_ssh, run_ssh_shell, QueueStatus};
use crate::config::HpcConfig;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    /// group -> (running, queued)
    pub groups: HashMap<String, (u32, u32)>,
    /// task_id -> (status, label)
    pub tasks: HashMap<i64, (QueueStatus, Option<String>)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareReading {
    pub util_percent: f64,
    pub mem_used: u64,
    pub mem_total: u64,
}

impl HardwareReading {
    pub fn mem_percent(self) -> f64 {
        if self.mem_total == 0 {
            0.0
        } else {
            self.mem_used as f64 / self.mem_total as f64 * 100.0
        }
    }

    /// "Hardware busy" per §4.3: utilization > 5% OR memory usage > 10%.
    pub fn is_hardware_busy(self) -> bool {
        self.util_percent > 5.0 || self.mem_percent() > 10.0
    }
}

#[async_trait]
pub trait RemoteProbe: Send + Sync {
    async fn list_groups(&self) -> Option<BTreeSet<String>>;
    async fn queue_status(&self) -> Option<QueueSnapshot>;
    async fn hardware_usage(&self) -> Option<HashMap<usize, HardwareReading>>;
}

pub struct SshRemoteProbe {
    hpc: HpcConfig,
    gpu_monitor_cmd: String,
}

impl SshRemoteProbe {
    pub fn new(hpc: HpcConfig) -> Self {
        Self {
            hpc,
            gpu_monitor_cmd:
                "nvidia-smi --query-gpu=index,uuid,utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits"
                    .to_string(),
        }
    }
}

#[async_trait]
impl RemoteProbe for SshRemoteProbe {
    async fn list_groups(&self) -> Option<BTreeSet<String>> {
        let output = run_ssh(
            &self.hpc,
            &[&self.hpc.remote_job_manager_command, "group"],
            30,
        )
        .await
        .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Some(parse_group_listing(&stdout))
    }

    async fn queue_status(&self) -> Option<QueueSnapshot> {
        let output = run_ssh(
            &self.hpc,
            &[&self.hpc.remote_job_manager_command, "status", "--json"],
            30,
        )
        .await
        .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_queue_status(&stdout)
    }

    async fn hardware_usage(&self) -> Option<HashMap<usize, HardwareReading>> {
        let output = run_ssh_shell(&self.hpc, &self.gpu_monitor_cmd, 30).await.ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Some(parse_hardware_csv(&stdout))
    }
}

/// Parses lines of the form `Group "name" (N parallel): status`,
/// extracting the quoted group name. Header/divider lines (containing
/// "Groups" or a run of `=`) and blank lines are skipped.
fn parse_group_listing(stdout: &str) -> BTreeSet<String> {
    let mut groups = BTreeSet::new();
    for line in stdout.lines() {
        if line.contains("Groups") || line.contains("======") || line.trim().is_empty() {
            continue;
        }
        if let Some(start) = line.find("Group \"") {
            let rest = &line[start + 7..];
            if let Some(end) = rest.find('"') {
                groups.insert(rest[..end].to_string());
            }
        }
    }
    groups
}

fn parse_queue_status(stdout: &str) -> Option<QueueSnapshot> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let mut snapshot = QueueSnapshot::default();

    if let Some(groups) = value.get("groups").and_then(|g| g.as_object()) {
        for (name, data) in groups {
            let running = data.get("running").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let queued = data.get("queued").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            snapshot.groups.insert(name.clone(), (running, queued));
        }
    }

    if let Some(tasks) = value.get("tasks").and_then(|t| t.as_object()) {
        for (id_str, data) in tasks {
            let Ok(id) = id_str.parse::<i64>() else {
                continue;
            };
            let status = data.get("status").and_then(|v| v.as_str()).unwrap_or("");
            let result = data.get("result").and_then(|v| v.as_str());
            let label = data
                .get("label")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            let mapped = match status {
                "Done" if result == Some("success") => QueueStatus::Success,
                "Done" => QueueStatus::Failure,
                "Failed" | "Killing" => QueueStatus::Failure,
                _ => QueueStatus::Running,
            };
            snapshot.tasks.insert(id, (mapped, label));
        }
    }

    Some(snapshot)
}

/// Parses `nvidia-smi --query-gpu=index,uuid,utilization.gpu,memory.used,memory.total`
/// CSV output, keyed by GPU index.
fn parse_hardware_csv(stdout: &str) -> HashMap<usize, HardwareReading> {
    let mut out = HashMap::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 5 {
            continue;
        }
        let Ok(index) = parts[0].parse::<usize>() else {
            continue;
        };
        let util = parts[2].parse::<f64>().unwrap_or(0.0);
        let mem_used = parts[3].parse::<u64>().unwrap_or(0);
        let mem_total = parts[4].parse::<u64>().unwrap_or(0);
        out.insert(
            index,
            HardwareReading {
                util_percent: util,
                mem_used,
                mem_total,
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_group_listing() {
        let stdout = "Groups\n======\nGroup \"gpu_0\" (1 parallel): Running\nGroup \"gpu_1\" (1 parallel): Paused\n";
        let groups = parse_group_listing(stdout);
        assert_eq!(
            groups,
            BTreeSet::from(["gpu_0".to_string(), "gpu_1".to_string()])
        );
    }

    #[test]
    fn parses_queue_status_success_and_failure() {
        let stdout = r#"{
            "groups": {"gpu_0": {"running": 1, "queued": 2}},
            "tasks": {
                "301": {"status": "Done", "result": "success", "label": "mqic_case_7_1000"},
                "302": {"status": "Failed", "label": "mqic_case_8_1001"},
                "303": {"status": "Running", "label": "mqic_case_9_1002"}
            }
        }"#;
        let snapshot = parse_queue_status(stdout).unwrap();
        assert_eq!(snapshot.groups.get("gpu_0"), Some(&(1, 2)));
        assert_eq!(snapshot.tasks.get(&301).unwrap().0, QueueStatus::Success);
        assert_eq!(snapshot.tasks.get(&302).unwrap().0, QueueStatus::Failure);
        assert_eq!(snapshot.tasks.get(&303).unwrap().0, QueueStatus::Running);
    }

    #[test]
    fn hardware_busy_thresholds() {
        let busy_by_util = HardwareReading {
            util_percent: 6.0,
            mem_used: 0,
            mem_total: 1000,
        };
        assert!(busy_by_util.is_hardware_busy());

        let busy_by_mem = HardwareReading {
            util_percent: 0.0,
            mem_used: 200,
            mem_total: 1000,
        };
        assert!(busy_by_mem.is_hardware_busy());

        let idle = HardwareReading {
            util_percent: 1.0,
            mem_used: 50,
            mem_total: 1000,
        };
        assert!(!idle.is_hardware_busy());
    }

    #[test]
    fn parses_hardware_csv_rows() {
        let stdout = "0, GPU-abc, 85, 1024, 8192\n1, GPU-def, 0, 12, 8192\n";
        let stats = parse_hardware_csv(stdout);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[&0].util_percent, 85.0);
        assert!(stats[&0].is_hardware_busy());
        assert!(!stats[&1].is_hardware_busy());
    }
}
