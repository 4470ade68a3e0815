// src/main.rs
//
// =============================================================================
// MQI SUPERVISOR: ENTRY POINT
// =============================================================================
//
// The wiring center: loads configuration, opens the state store, and
// either prints a status snapshot (`--status`) or boots the Case
// Watcher and Supervisor Loop and runs until a shutdown signal arrives
// (§6/§10.5).

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use mqi_supervisor::config::Config;
use mqi_supervisor::gpu_manager::GpuManager;
use mqi_supervisor::local_executor::SubprocessLocalExecutor;
use mqi_supervisor::model::{CaseStatus, GpuStatus};
use mqi_supervisor::remote::executor::SshRemoteExecutor;
use mqi_supervisor::remote::probe::SshRemoteProbe;
use mqi_supervisor::scheduler::{PriorityScheduler, SchedulingAlgorithm};
use mqi_supervisor::store::Store;
use mqi_supervisor::tps::NoopPlanInfoProvider;
use mqi_supervisor::supervisor::SupervisorLoop;
use mqi_supervisor::watcher::CaseWatcher;
use mqi_supervisor::worker_pool::WorkerPool;
use mqi_supervisor::workflow::WorkflowStateMachine;

#[derive(Debug, Parser)]
#[command(name = "mqi-supervisor", about = "Radiotherapy case orchestration supervisor")]
struct Cli {
    /// Path to the YAML configuration file (§10.3).
    #[arg(long)]
    config: std::path::PathBuf,

    /// Print a snapshot of cases and GPU resources and exit, instead of
    /// running the supervisor (§10.5).
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("fatal: {e:?}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config).context("failed to load configuration")?;
    let store = Arc::new(Store::open(&config.state_db_path).context("failed to open state store")?);

    if cli.status {
        print_status(&store)?;
        return Ok(());
    }

    let config = Arc::new(config);

    let probe: Arc<dyn mqi_supervisor::remote::probe::RemoteProbe> =
        Arc::new(SshRemoteProbe::new(config.hpc.clone()));
    let remote: Arc<dyn mqi_supervisor::remote::executor::RemoteExecutor> = Arc::new(
        SshRemoteExecutor::new(config.hpc.clone(), Box::new(SshRemoteProbe::new(config.hpc.clone()))),
    );
    let local = Arc::new(SubprocessLocalExecutor::new(
        config.local_tools.mqi_interpreter.clone(),
        config.local_tools.raw2dcm.clone(),
    ));
    let plan_info = Arc::new(NoopPlanInfoProvider);

    let workflow = Arc::new(WorkflowStateMachine::new(
        store.clone(),
        remote.clone(),
        local,
        plan_info,
        config.clone(),
    ));

    let worker_pool = Arc::new(WorkerPool::new(
        workflow,
        config.max_workers,
        config.processing_timeout_seconds,
    ));

    let gpu_manager = Arc::new(GpuManager::new(store.clone(), probe));

    let scheduler = Arc::new(PriorityScheduler::new(
        SchedulingAlgorithm::parse(&config.priority_scheduling.algorithm),
        config.priority_scheduling.aging_factor,
        config.priority_scheduling.starvation_threshold_hours,
    ));

    let supervisor = Arc::new(SupervisorLoop::new(
        store.clone(),
        remote,
        gpu_manager,
        scheduler,
        worker_pool,
        config.sleep_interval_seconds,
        config.running_case_timeout_hours,
        config.gpu_refresh_interval_iterations,
        config.batch_size,
    ));

    let watcher = CaseWatcher::new(store.clone(), config.watch_dir.clone(), config.quiescence_period_seconds);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let watcher_handle = tokio::spawn(async move {
        if let Err(e) = watcher.run().await {
            log::error!("case watcher exited: {e:?}");
        }
    });

    let supervisor_handle = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    log::info!("shutdown signal received, stopping new dispatch and draining workers");
    let _ = shutdown_tx.send(true);

    supervisor_handle.await.context("supervisor loop task panicked")?;
    watcher_handle.abort();

    Ok(())
}

/// A plain-text snapshot of cases by status and GPU resources, for
/// `--status` (§10.5). Opens the store but starts no background work.
fn print_status(store: &Store) -> Result<()> {
    println!("== Cases ==");
    for status in [
        CaseStatus::Submitted,
        CaseStatus::Preprocessing,
        CaseStatus::Preprocessed,
        CaseStatus::GeneratingTps,
        CaseStatus::TpsGenerated,
        CaseStatus::Uploading,
        CaseStatus::Uploaded,
        CaseStatus::Submitting,
        CaseStatus::Running,
        CaseStatus::Polled,
        CaseStatus::Downloading,
        CaseStatus::Downloaded,
        CaseStatus::Postprocessing,
        CaseStatus::Completed,
        CaseStatus::Failed,
    ] {
        let cases = store.list_cases_by_status(status, None)?;
        if cases.is_empty() {
            continue;
        }
        println!("-- {status} ({}) --", cases.len());
        for case in cases {
            println!(
                "  #{:<6} {:<30} progress={:<4} priority={:?} gpu={}",
                case.id,
                case.case_name(),
                case.progress,
                case.priority,
                case.gpu_group.as_deref().unwrap_or("-"),
            );
        }
    }

    println!("\n== GPU resources ==");
    for status in [GpuStatus::Available, GpuStatus::Assigned, GpuStatus::Busy, GpuStatus::Zombie] {
        let resources = store.list_gpu_resources_by_status(status)?;
        if resources.is_empty() {
            continue;
        }
        println!("-- {status} ({}) --", resources.len());
        for gpu in resources {
            println!(
                "  {:<10} case={}",
                gpu.group_name,
                gpu.assigned_case_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            );
        }
    }

    Ok(())
}
