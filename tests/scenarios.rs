// tests/scenarios.rs
//
// The six literal end-to-end scenarios from §8, each
// driven by constructing the real collaborators (Store, GpuManager,
// PriorityScheduler, WorkerPool, SupervisorLoop) against a scripted
// Remote Executor/Probe and a no-op Local Executor, then running one
// supervisor tick and asserting on the resulting Store state.

mod common;

use common::{test_config, NoopLocal, NullProbe, ScriptedRemote};
use mqi_supervisor::gpu_manager::GpuManager;
use mqi_supervisor::model::{CasePriority, CaseStatus, GpuStatus, StepStatus};
use mqi_supervisor::remote::TaskLookup;
use mqi_supervisor::scheduler::{PriorityScheduler, SchedulingAlgorithm};
use mqi_supervisor::store::Store;
use mqi_supervisor::supervisor::SupervisorLoop;
use mqi_supervisor::tps::NoopPlanInfoProvider;
use mqi_supervisor::worker_pool::WorkerPool;
use mqi_supervisor::workflow::WorkflowStateMachine;
use rusqlite::Connection;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{sleep, Duration, Instant};

async fn wait_until_terminal(store: &Store, case_id: i64) -> mqi_supervisor::model::Case {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let case = store.get_case(case_id).unwrap().unwrap();
        if case.status.is_terminal() {
            return case;
        }
        if Instant::now() > deadline {
            panic!("case {case_id} never reached a terminal state, stuck at {:?}", case.status);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Directly rewrites `status_updated_at` on a case row — the Store
/// exposes no operation for backdating a timestamp, and the timeout
/// scenario needs one older than `running_case_timeout_hours`.
fn backdate_status(db_path: &std::path::Path, case_id: i64, hours_ago: i64) {
    let conn = Connection::open(db_path).unwrap();
    let stamp = (chrono::Utc::now() - chrono::Duration::hours(hours_ago)).to_rfc3339();
    conn.execute(
        "UPDATE cases SET status_updated_at = ?1 WHERE case_id = ?2",
        rusqlite::params![stamp, case_id],
    )
    .unwrap();
}

#[tokio::test]
async fn happy_path_completes_with_full_progress_and_step_history() {
    let dir = tempdir().unwrap();
    let case_dir = dir.path().join("cases").join("A");
    std::fs::create_dir_all(&case_dir).unwrap();
    let db_path = dir.path().join("state.db");

    let store = Arc::new(Store::open(&db_path).unwrap());
    let case_id = store.add_case(case_dir.to_str().unwrap(), CasePriority::Normal).unwrap();
    store.ensure_gpu_exists("gpu_0").unwrap();

    let config = Arc::new(test_config(dir.path().join("cases").to_str().unwrap(), db_path.to_str().unwrap()));
    let remote = Arc::new(ScriptedRemote::default());
    let workflow = Arc::new(WorkflowStateMachine::new(
        store.clone(),
        remote.clone(),
        Arc::new(NoopLocal),
        Arc::new(NoopPlanInfoProvider),
        config.clone(),
    ));
    let worker_pool = Arc::new(WorkerPool::new(workflow, 1, 30));
    let gpu_manager = Arc::new(GpuManager::new(store.clone(), Arc::new(NullProbe)));
    let scheduler = Arc::new(PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0));
    let supervisor = SupervisorLoop::new(
        store.clone(),
        remote,
        gpu_manager,
        scheduler,
        worker_pool,
        5,
        12.0,
        5,
        4,
    );

    supervisor.tick(false).await;

    let case = wait_until_terminal(&store, case_id).await;
    assert_eq!(case.status, CaseStatus::Completed);
    assert_eq!(case.progress, 100);
    assert!(case.completed_at.is_some());

    let gpu = store.get_gpu("gpu_0").unwrap().unwrap();
    assert_eq!(gpu.status, GpuStatus::Available);
    assert_eq!(gpu.assigned_case_id, None);

    let steps = store.list_workflow_steps(case_id).unwrap();
    assert_eq!(steps.len(), 7, "expected one WorkflowStep record per pipeline step");
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn crash_recovery_reattaches_a_stuck_submitting_case() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let store = Arc::new(Store::open(&db_path).unwrap());

    let case_id = store.add_case(dir.path().join("cases/A").to_str().unwrap(), CasePriority::Normal).unwrap();
    store.ensure_gpu_exists("gpu_0").unwrap();
    store.try_lock_gpu(case_id, "gpu_0").unwrap();
    store.update_case_status(case_id, CaseStatus::Submitting, 35).unwrap();

    let remote = Arc::new(ScriptedRemote::default());
    *remote.find_task_result.lock().unwrap() = TaskLookup::Found(301);

    let config = Arc::new(test_config(dir.path().join("cases").to_str().unwrap(), db_path.to_str().unwrap()));
    let workflow = Arc::new(WorkflowStateMachine::new(
        store.clone(),
        remote.clone(),
        Arc::new(NoopLocal),
        Arc::new(NoopPlanInfoProvider),
        config,
    ));
    let worker_pool = Arc::new(WorkerPool::new(workflow, 1, 30));
    let gpu_manager = Arc::new(GpuManager::new(store.clone(), Arc::new(NullProbe)));
    let scheduler = Arc::new(PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0));
    let supervisor = SupervisorLoop::new(store.clone(), remote, gpu_manager, scheduler, worker_pool, 5, 12.0, 5, 4);

    supervisor.tick(false).await;

    let case = store.get_case(case_id).unwrap().unwrap();
    assert_eq!(case.status, CaseStatus::Running);
    assert_eq!(case.remote_task_id, Some(301));
    assert_eq!(case.progress, 30);
    assert!(!case.status.is_terminal());

    let gpu = store.get_gpu("gpu_0").unwrap().unwrap();
    assert_eq!(gpu.status, GpuStatus::Assigned, "gpu must not be released during recovery");
}

#[tokio::test]
async fn crash_recovery_fails_a_stuck_submitting_case_whose_submission_never_landed() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let store = Arc::new(Store::open(&db_path).unwrap());

    let case_id = store.add_case(dir.path().join("cases/A").to_str().unwrap(), CasePriority::Normal).unwrap();
    store.ensure_gpu_exists("gpu_0").unwrap();
    store.try_lock_gpu(case_id, "gpu_0").unwrap();
    store.update_case_status(case_id, CaseStatus::Submitting, 35).unwrap();

    let remote = Arc::new(ScriptedRemote::default());
    *remote.find_task_result.lock().unwrap() = TaskLookup::NotFound;

    let config = Arc::new(test_config(dir.path().join("cases").to_str().unwrap(), db_path.to_str().unwrap()));
    let workflow = Arc::new(WorkflowStateMachine::new(
        store.clone(),
        remote.clone(),
        Arc::new(NoopLocal),
        Arc::new(NoopPlanInfoProvider),
        config,
    ));
    let worker_pool = Arc::new(WorkerPool::new(workflow, 1, 30));
    let gpu_manager = Arc::new(GpuManager::new(store.clone(), Arc::new(NullProbe)));
    let scheduler = Arc::new(PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0));
    let supervisor = SupervisorLoop::new(store.clone(), remote, gpu_manager, scheduler, worker_pool, 5, 12.0, 5, 4);

    supervisor.tick(false).await;

    let case = store.get_case(case_id).unwrap().unwrap();
    assert_eq!(case.status, CaseStatus::Failed);
    assert!(case.completed_at.is_some());

    let gpu = store.get_gpu("gpu_0").unwrap().unwrap();
    assert_eq!(gpu.status, GpuStatus::Available, "gpu must be released once the submission is known to have never landed");
    assert_eq!(gpu.assigned_case_id, None);
}

#[tokio::test]
async fn timeout_with_unreclaimable_gpu_marks_zombie() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let store = Arc::new(Store::open(&db_path).unwrap());

    let case_id = store.add_case(dir.path().join("cases/A").to_str().unwrap(), CasePriority::Normal).unwrap();
    store.ensure_gpu_exists("gpu_0").unwrap();
    store.try_lock_gpu(case_id, "gpu_0").unwrap();
    store.set_case_remote_task_id(case_id, 77).unwrap();
    store.update_case_status(case_id, CaseStatus::Running, 40).unwrap();
    backdate_status(&db_path, case_id, 13);

    let remote = Arc::new(ScriptedRemote::default());
    *remote.kill_result.lock().unwrap() = false;

    let config = Arc::new(test_config(dir.path().join("cases").to_str().unwrap(), db_path.to_str().unwrap()));
    let workflow = Arc::new(WorkflowStateMachine::new(
        store.clone(),
        remote.clone(),
        Arc::new(NoopLocal),
        Arc::new(NoopPlanInfoProvider),
        config,
    ));
    let worker_pool = Arc::new(WorkerPool::new(workflow, 1, 30));
    let gpu_manager = Arc::new(GpuManager::new(store.clone(), Arc::new(NullProbe)));
    let scheduler = Arc::new(PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0));
    // running_case_timeout_hours = 12.0, case last updated 13 hours ago.
    let supervisor = SupervisorLoop::new(store.clone(), remote, gpu_manager, scheduler, worker_pool, 5, 12.0, 5, 4);

    supervisor.tick(false).await;

    let case = store.get_case(case_id).unwrap().unwrap();
    assert_eq!(case.status, CaseStatus::Failed);
    assert!(case.completed_at.is_some());

    let gpu = store.get_gpu("gpu_0").unwrap().unwrap();
    assert_eq!(gpu.status, GpuStatus::Zombie, "unkillable task must leave the gpu as a zombie, not released");
    assert_eq!(gpu.assigned_case_id, Some(case_id));
}

#[tokio::test]
async fn zombie_reclaim_releases_the_gpu_once_the_kill_finally_succeeds() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let store = Arc::new(Store::open(&db_path).unwrap());

    let case_id = store.add_case(dir.path().join("cases/A").to_str().unwrap(), CasePriority::Normal).unwrap();
    store.ensure_gpu_exists("gpu_0").unwrap();
    store.try_lock_gpu(case_id, "gpu_0").unwrap();
    store.set_case_remote_task_id(case_id, 105).unwrap();
    store.set_case_error(case_id, "running case exceeded timeout").unwrap();
    store.update_case_completion(case_id, CaseStatus::Failed).unwrap();
    store.set_gpu_status("gpu_0", GpuStatus::Zombie, Some(case_id)).unwrap();

    let remote = Arc::new(ScriptedRemote::default());
    *remote.kill_result.lock().unwrap() = true;

    let config = Arc::new(test_config(dir.path().join("cases").to_str().unwrap(), db_path.to_str().unwrap()));
    let workflow = Arc::new(WorkflowStateMachine::new(
        store.clone(),
        remote.clone(),
        Arc::new(NoopLocal),
        Arc::new(NoopPlanInfoProvider),
        config,
    ));
    let worker_pool = Arc::new(WorkerPool::new(workflow, 1, 30));
    let gpu_manager = Arc::new(GpuManager::new(store.clone(), Arc::new(NullProbe)));
    let scheduler = Arc::new(PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0));
    let supervisor = SupervisorLoop::new(store.clone(), remote, gpu_manager, scheduler, worker_pool, 5, 12.0, 5, 4);

    supervisor.tick(false).await;

    let gpu = store.get_gpu("gpu_0").unwrap().unwrap();
    assert_eq!(gpu.status, GpuStatus::Available);
    assert_eq!(gpu.assigned_case_id, None);
}

#[tokio::test]
async fn gpu_exhaustion_defers_dispatch_without_mutating_anything() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let store = Arc::new(Store::open(&db_path).unwrap());

    let case_a = store.add_case(dir.path().join("cases/A").to_str().unwrap(), CasePriority::Normal).unwrap();
    let case_b = store.add_case(dir.path().join("cases/B").to_str().unwrap(), CasePriority::Normal).unwrap();

    store.ensure_gpu_exists("gpu_0").unwrap();
    store.ensure_gpu_exists("gpu_1").unwrap();
    // Both groups are assigned to some other (unrelated) case already.
    let other = store.add_case(dir.path().join("cases/Other").to_str().unwrap(), CasePriority::Normal).unwrap();
    store.try_lock_gpu(other, "gpu_0").unwrap();
    store.try_lock_gpu(other, "gpu_1").unwrap();

    let remote = Arc::new(ScriptedRemote::default());
    let config = Arc::new(test_config(dir.path().join("cases").to_str().unwrap(), db_path.to_str().unwrap()));
    let workflow = Arc::new(WorkflowStateMachine::new(
        store.clone(),
        remote.clone(),
        Arc::new(NoopLocal),
        Arc::new(NoopPlanInfoProvider),
        config,
    ));
    let worker_pool = Arc::new(WorkerPool::new(workflow, 2, 30));
    let gpu_manager = Arc::new(GpuManager::new(store.clone(), Arc::new(NullProbe)));
    let scheduler = Arc::new(PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0));
    let supervisor = SupervisorLoop::new(store.clone(), remote, gpu_manager, scheduler, worker_pool, 5, 12.0, 5, 4);

    supervisor.tick(false).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(store.get_case(case_a).unwrap().unwrap().status, CaseStatus::Submitted);
    assert_eq!(store.get_case(case_b).unwrap().unwrap().status, CaseStatus::Submitted);
    assert_eq!(store.get_gpu("gpu_0").unwrap().unwrap().assigned_case_id, Some(other));
    assert_eq!(store.get_gpu("gpu_1").unwrap().unwrap().assigned_case_id, Some(other));
}

#[tokio::test]
async fn priority_precedence_dispatches_highest_first() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let store = Arc::new(Store::open(&db_path).unwrap());

    // Same created_at (inserted back to back): strict priority ordering
    // must still place high before normal before low.
    let low = store.add_case(dir.path().join("cases/Low").to_str().unwrap(), CasePriority::Low).unwrap();
    let high = store.add_case(dir.path().join("cases/High").to_str().unwrap(), CasePriority::High).unwrap();
    let normal = store.add_case(dir.path().join("cases/Normal").to_str().unwrap(), CasePriority::Normal).unwrap();
    store.ensure_gpu_exists("gpu_0").unwrap();

    let remote = Arc::new(ScriptedRemote::default());
    let config = Arc::new(test_config(dir.path().join("cases").to_str().unwrap(), db_path.to_str().unwrap()));
    let workflow = Arc::new(WorkflowStateMachine::new(
        store.clone(),
        remote.clone(),
        Arc::new(NoopLocal),
        Arc::new(NoopPlanInfoProvider),
        config,
    ));
    // A single worker slot: the worker pool can only actually start one
    // case's run at a time, so which one gets the gpu/dispatch first is
    // the whole story for this scenario.
    let worker_pool = Arc::new(WorkerPool::new(workflow, 1, 30));
    let gpu_manager = Arc::new(GpuManager::new(store.clone(), Arc::new(NullProbe)));
    let scheduler = Arc::new(PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0));
    let supervisor = SupervisorLoop::new(store.clone(), remote, gpu_manager, scheduler, worker_pool, 5, 12.0, 5, 4);

    supervisor.tick(false).await;

    let gpu = store.get_gpu("gpu_0").unwrap().unwrap();
    assert_eq!(gpu.assigned_case_id, Some(high), "the only available gpu must go to the highest-priority case");
    assert_eq!(store.get_case(normal).unwrap().unwrap().status, CaseStatus::Submitted);
    assert_eq!(store.get_case(low).unwrap().unwrap().status, CaseStatus::Submitted);
}
