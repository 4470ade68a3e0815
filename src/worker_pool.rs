// src/worker_pool.rs
//
// The Worker Pool (§4.10): a fixed-size concurrency gate
// around `WorkflowStateMachine::run_case`, with an in-flight set
// preventing a case from running on two workers at once and an outer
// per-case timeout that abandons (does not cancel cleanly) a worker
// stuck past `processing_timeout_seconds`, leaving recovery to the
// Supervisor Loop's Phase 2. Same semaphore-gated `tokio::spawn` per
// accepted unit of work as the rest of this codebase's worker pools,
// holding the permit for the duration of the task.

use crate::workflow::WorkflowStateMachine;
use crate::{log_error, log_info, log_warn};
use crate::logging::LogContext;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    total_processed: AtomicU64,
    total_successful: AtomicU64,
    total_failed: AtomicU64,
    total_timed_out: AtomicU64,
    total_processing_millis: AtomicU64,
    peak_concurrency: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolMetricsSnapshot {
    pub total_processed: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub average_processing_millis: u64,
    pub peak_concurrency: usize,
    pub success_rate: f64,
}

impl WorkerPoolMetrics {
    fn record(&self, outcome: ProcessOutcome, elapsed: Duration) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        match outcome {
            ProcessOutcome::Success => {
                self.total_successful.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::Failure => {
                self.total_failed.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::TimedOut => {
                self.total_timed_out.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn observe_concurrency(&self, in_flight: usize) {
        self.peak_concurrency.fetch_max(in_flight, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerPoolMetricsSnapshot {
        let total = self.total_processed.load(Ordering::Relaxed);
        let successful = self.total_successful.load(Ordering::Relaxed);
        let average = if total == 0 {
            0
        } else {
            self.total_processing_millis.load(Ordering::Relaxed) / total
        };
        WorkerPoolMetricsSnapshot {
            total_processed: total,
            total_successful: successful,
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_timed_out: self.total_timed_out.load(Ordering::Relaxed),
            average_processing_millis: average,
            peak_concurrency: self.peak_concurrency.load(Ordering::Relaxed),
            success_rate: if total == 0 { 0.0 } else { successful as f64 / total as f64 },
        }
    }
}

enum ProcessOutcome {
    Success,
    Failure,
    TimedOut,
}

/// Bounds concurrent case processing to `max_workers` and guarantees
/// at most one worker is ever attached to a given case id (§4.10/§5).
pub struct WorkerPool {
    workflow: Arc<WorkflowStateMachine>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<i64>>>,
    processing_timeout: Duration,
    metrics: Arc<WorkerPoolMetrics>,
}

impl WorkerPool {
    pub fn new(workflow: Arc<WorkflowStateMachine>, max_workers: usize, processing_timeout_seconds: u64) -> Self {
        Self {
            workflow,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            processing_timeout: Duration::from_secs(processing_timeout_seconds),
            metrics: Arc::new(WorkerPoolMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<WorkerPoolMetrics> {
        self.metrics.clone()
    }

    /// Attempts to hand `case_id` to a worker. Returns immediately
    /// (`false`) without blocking the caller if the case is already
    /// in flight or no worker slot is free right now — the Supervisor
    /// Loop's dispatch phase treats either as "try again next tick",
    /// never as an error (§4.8 Phase 4).
    pub fn try_dispatch(&self, case_id: i64) -> bool {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if in_flight.contains(&case_id) {
                return false;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                return false;
            };
            in_flight.insert(case_id);
            drop(in_flight);

            let workflow = self.workflow.clone();
            let in_flight_handle = self.in_flight.clone();
            let metrics = self.metrics.clone();
            let timeout = self.processing_timeout;

            tokio::spawn(async move {
                let _permit = permit;
                let concurrency = in_flight_handle.lock().unwrap().len();
                metrics.observe_concurrency(concurrency);

                let ctx = LogContext::new("worker_pool_process").case(case_id);
                log_info!(ctx, "starting");
                let start = Instant::now();

                let outcome = match tokio::time::timeout(timeout, workflow.run_case(case_id)).await {
                    Ok(Ok(())) => {
                        log_info!(ctx, "finished cleanly");
                        ProcessOutcome::Success
                    }
                    Ok(Err(e)) => {
                        log_error!(ctx, "finished with error: {e}");
                        ProcessOutcome::Failure
                    }
                    Err(_) => {
                        // Abandoned mid-step: the case is left wherever
                        // it was when the timeout fired. No active
                        // worker owns it anymore; the Supervisor Loop's
                        // Phase 2 is the only path that can bring it to
                        // a terminal state from here (§4.8/§4.10).
                        log_warn!(ctx, "processing timeout exceeded after {:?}, abandoning", timeout);
                        ProcessOutcome::TimedOut
                    }
                };

                metrics.record(outcome, start.elapsed());
                in_flight_handle.lock().unwrap().remove(&case_id);
            });
        }
        true
    }
}
