// src/gpu_manager.rs
//
// The GPU Manager (§4.7): keeps the State Store's GPU
// resource table in sync with what the remote job manager and
// nvidia-smi report, and picks the least-loaded group for a new
// dispatch. Skips the whole reconciliation cycle if either probe call
// comes back unreachable, and scores groups by a composite load
// formula, reading and writing through `store::Store` rather than
// holding its own in-process state.

use crate::model::{group_to_hardware_indices, GpuStatus};
use crate::remote::probe::RemoteProbe;
use crate::store::Store;
use crate::{log_info, log_warn};
use crate::logging::LogContext;
use anyhow::Result;
use std::sync::Arc;

pub struct GpuManager {
    store: Arc<Store>,
    probe: Arc<dyn RemoteProbe>,
}

impl GpuManager {
    pub fn new(store: Arc<Store>, probe: Arc<dyn RemoteProbe>) -> Self {
        Self { store, probe }
    }

    /// `ListGroups` -> `EnsureGpuExists` for any group the store does
    /// not yet know about (§4.7 step 1). A probe failure here is
    /// log-and-skip, not fatal — the next reconciliation tick tries
    /// again.
    pub async fn discover_groups(&self) -> Result<()> {
        let ctx = LogContext::new("gpu_discover_groups");
        let Some(groups) = self.probe.list_groups().await else {
            log_warn!(ctx, "remote group listing unreachable, skipping discovery");
            return Ok(());
        };
        for group in groups {
            self.store.ensure_gpu_exists(&group)?;
        }
        Ok(())
    }

    /// Reconciles queue load and hardware utilization into each
    /// non-assigned, non-zombie group's availability (§4.7 step 2). If
    /// either probe call is unreachable, the entire cycle is skipped —
    /// partial reconciliation against one stale signal would be worse
    /// than no reconciliation (§7).
    pub async fn reconcile(&self) -> Result<()> {
        let ctx = LogContext::new("gpu_reconcile");
        let (Some(queue), Some(hardware)) =
            (self.probe.queue_status().await, self.probe.hardware_usage().await)
        else {
            log_warn!(ctx, "queue or hardware probe unreachable, skipping reconciliation");
            return Ok(());
        };

        for resource in self.store.list_gpu_resources()? {
            if matches!(resource.status, GpuStatus::Assigned | GpuStatus::Zombie) {
                continue;
            }

            let queue_load = queue
                .groups
                .get(&resource.group_name)
                .map(|(running, queued)| running + queued)
                .unwrap_or(0);

            let hardware_busy = group_to_hardware_indices(&resource.group_name)
                .iter()
                .any(|idx| hardware.get(idx).map(|r| r.is_hardware_busy()).unwrap_or(false));

            let new_status = if queue_load > 0 || hardware_busy {
                GpuStatus::Busy
            } else {
                GpuStatus::Available
            };

            if new_status != resource.status {
                log_info!(
                    ctx.clone().gpu_group(resource.group_name.clone()),
                    "status {} -> {}",
                    resource.status,
                    new_status
                );
                self.store.set_gpu_status(&resource.group_name, new_status, None)?;
            }
        }

        Ok(())
    }

    /// Composite load score among `available` groups: queue length plus
    /// the sum of utilization and memory fractions across the group's
    /// mapped hardware indices. Lower is better; ties are broken
    /// lexicographically by group name (§4.7 "ChooseOptimal").
    pub async fn choose_optimal(&self) -> Result<Option<String>> {
        let available = self.store.list_gpu_resources_by_status(GpuStatus::Available)?;
        if available.is_empty() {
            return Ok(None);
        }

        let queue = self.probe.queue_status().await;
        let hardware = self.probe.hardware_usage().await;

        let mut scored: Vec<(f64, String)> = available
            .into_iter()
            .filter_map(|resource| {
                let running = queue
                    .as_ref()
                    .and_then(|q| q.groups.get(&resource.group_name))
                    .map(|(running, _queued)| *running)
                    .unwrap_or(0);
                if running > 0 {
                    return None;
                }

                let indices = group_to_hardware_indices(&resource.group_name);
                let hardware_busy = indices
                    .iter()
                    .any(|idx| hardware.as_ref().and_then(|h| h.get(idx)).map(|r| r.is_hardware_busy()).unwrap_or(false));
                if hardware_busy {
                    return None;
                }

                let queue_load = queue
                    .as_ref()
                    .and_then(|q| q.groups.get(&resource.group_name))
                    .map(|(running, queued)| (running + queued) as f64)
                    .unwrap_or(0.0);

                let hardware_load: f64 = indices
                    .iter()
                    .filter_map(|idx| hardware.as_ref().and_then(|h| h.get(idx)))
                    .map(|reading| reading.util_percent / 100.0 + reading.mem_percent() / 100.0)
                    .sum();

                Some((queue_load + hardware_load, resource.group_name))
            })
            .collect();

        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        Ok(scored.into_iter().next().map(|(_, name)| name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::probe::{HardwareReading, QueueSnapshot};
    use async_trait::async_trait;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeProbe {
        groups: Mutex<Option<BTreeSet<String>>>,
        queue: Mutex<Option<QueueSnapshot>>,
        hardware: Mutex<Option<HashMap<usize, HardwareReading>>>,
    }

    #[async_trait]
    impl RemoteProbe for FakeProbe {
        async fn list_groups(&self) -> Option<BTreeSet<String>> {
            self.groups.lock().unwrap().clone()
        }
        async fn queue_status(&self) -> Option<QueueSnapshot> {
            self.queue.lock().unwrap().clone()
        }
        async fn hardware_usage(&self) -> Option<HashMap<usize, HardwareReading>> {
            self.hardware.lock().unwrap().clone()
        }
    }

    fn open_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("state.db")).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn discover_groups_registers_new_groups() {
        let (_d, store) = open_store();
        let probe = Arc::new(FakeProbe {
            groups: Mutex::new(Some(BTreeSet::from(["gpu_0".to_string(), "gpu_1".to_string()]))),
            queue: Mutex::new(None),
            hardware: Mutex::new(None),
        });
        let manager = GpuManager::new(store.clone(), probe);
        manager.discover_groups().await.unwrap();
        assert_eq!(store.list_gpu_resources().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unreachable_probe_skips_entire_reconcile_cycle() {
        let (_d, store) = open_store();
        store.ensure_gpu_exists("gpu_0").unwrap();
        let probe = Arc::new(FakeProbe {
            groups: Mutex::new(None),
            queue: Mutex::new(None),
            hardware: Mutex::new(Some(HashMap::new())),
        });
        let manager = GpuManager::new(store.clone(), probe);
        manager.reconcile().await.unwrap();
        let gpu = store.get_gpu("gpu_0").unwrap().unwrap();
        assert_eq!(gpu.status, GpuStatus::Available);
    }

    #[tokio::test]
    async fn busy_hardware_marks_group_busy() {
        let (_d, store) = open_store();
        store.ensure_gpu_exists("gpu_0").unwrap();
        let mut hardware = HashMap::new();
        hardware.insert(0, HardwareReading { util_percent: 80.0, mem_used: 1, mem_total: 1 });
        let probe = Arc::new(FakeProbe {
            groups: Mutex::new(None),
            queue: Mutex::new(Some(QueueSnapshot::default())),
            hardware: Mutex::new(Some(hardware)),
        });
        let manager = GpuManager::new(store.clone(), probe);
        manager.reconcile().await.unwrap();
        let gpu = store.get_gpu("gpu_0").unwrap().unwrap();
        assert_eq!(gpu.status, GpuStatus::Busy);
    }

    #[tokio::test]
    async fn choose_optimal_picks_lowest_load_breaking_ties_lexicographically() {
        let (_d, store) = open_store();
        store.ensure_gpu_exists("gpu_1").unwrap();
        store.ensure_gpu_exists("gpu_0").unwrap();
        let mut queue = QueueSnapshot::default();
        queue.groups.insert("gpu_1".to_string(), (0, 0));
        queue.groups.insert("gpu_0".to_string(), (0, 0));
        let probe = Arc::new(FakeProbe {
            groups: Mutex::new(None),
            queue: Mutex::new(Some(queue)),
            hardware: Mutex::new(Some(HashMap::new())),
        });
        let manager = GpuManager::new(store.clone(), probe);
        let chosen = manager.choose_optimal().await.unwrap();
        assert_eq!(chosen.as_deref(), Some("gpu_0"));
    }

    #[tokio::test]
    async fn choose_optimal_excludes_groups_with_running_tasks_or_busy_hardware() {
        let (_d, store) = open_store();
        store.ensure_gpu_exists("gpu_0").unwrap();
        store.ensure_gpu_exists("gpu_1").unwrap();
        let mut queue = QueueSnapshot::default();
        queue.groups.insert("gpu_0".to_string(), (1, 0));
        queue.groups.insert("gpu_1".to_string(), (0, 0));
        let probe = Arc::new(FakeProbe {
            groups: Mutex::new(None),
            queue: Mutex::new(Some(queue)),
            hardware: Mutex::new(Some(HashMap::new())),
        });
        let manager = GpuManager::new(store.clone(), probe);
        // gpu_0 has a running task in the queue and must be excluded
        // even though the store still marks it `available` (§4.7 step 4).
        assert_eq!(manager.choose_optimal().await.unwrap().as_deref(), Some("gpu_1"));
    }

    #[tokio::test]
    async fn choose_optimal_none_when_nothing_available() {
        let (_d, store) = open_store();
        let probe = Arc::new(FakeProbe {
            groups: Mutex::new(None),
            queue: Mutex::new(None),
            hardware: Mutex::new(None),
        });
        let manager = GpuManager::new(store, probe);
        assert_eq!(manager.choose_optimal().await.unwrap(), None);
    }
}
