// src/lib.rs
//
// =============================================================================
// MQI SUPERVISOR: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare modules
pub mod config;
pub mod error;
pub mod gpu_manager;
pub mod local_executor;
pub mod logging;
pub mod model;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod tps;
pub mod watcher;
pub mod worker_pool;
pub mod workflow;

// 2. Re-exports (the public API)

pub use config::Config;
pub use model::{Case, CasePriority, CaseStatus, GpuResource, GpuStatus};
pub use scheduler::{PriorityScheduler, SchedulingAlgorithm};
pub use store::Store;
pub use supervisor::SupervisorLoop;
pub use watcher::CaseWatcher;
pub use worker_pool::WorkerPool;
pub use workflow::WorkflowStateMachine;
