// src/scheduler.rs
//
// The Priority Scheduler (§4.9): orders pending cases for
// dispatch, applying aging/starvation prevention per the configured
// algorithm. Derives a score from a base priority value plus elapsed
// wait time, adapted to the three named strategies.

use crate::model::{Case, CasePriority};
use chrono::Utc;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingAlgorithm {
    StrictPriority,
    Aging,
    WeightedFairQueuing,
}

impl SchedulingAlgorithm {
    pub fn parse(name: &str) -> Self {
        match name {
            "aging" => SchedulingAlgorithm::Aging,
            "weighted_fair_queuing" | "wfq" => SchedulingAlgorithm::WeightedFairQueuing,
            _ => SchedulingAlgorithm::StrictPriority,
        }
    }
}

const STARVATION_BOOST: f64 = 2.0;

/// In-memory counters recorded for every scheduling decision (§4.9):
/// cases-by-priority, average wait time by priority, and how many
/// times the starvation boost fired. Reset only by process restart —
/// these are observability counters, not persisted state.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub cases_by_priority: std::collections::HashMap<CasePriority, u64>,
    pub total_wait_hours_by_priority: std::collections::HashMap<CasePriority, f64>,
    pub starvation_prevented: u64,
}

impl SchedulerMetrics {
    pub fn average_wait_hours(&self, priority: CasePriority) -> f64 {
        let count = self.cases_by_priority.get(&priority).copied().unwrap_or(0);
        if count == 0 {
            return 0.0;
        }
        self.total_wait_hours_by_priority.get(&priority).copied().unwrap_or(0.0) / count as f64
    }
}

pub struct PriorityScheduler {
    algorithm: SchedulingAlgorithm,
    aging_factor: f64,
    starvation_threshold_hours: f64,
    metrics: Mutex<SchedulerMetrics>,
}

impl PriorityScheduler {
    pub fn new(algorithm: SchedulingAlgorithm, aging_factor: f64, starvation_threshold_hours: f64) -> Self {
        Self {
            algorithm,
            aging_factor,
            starvation_threshold_hours,
            metrics: Mutex::new(SchedulerMetrics::default()),
        }
    }

    /// Orders `pending` cases by the configured strategy and truncates
    /// to `batch_size`. Zero pending cases is a no-op that touches no
    /// metrics (§8 boundary behavior).
    pub fn order(&self, mut pending: Vec<Case>, batch_size: usize) -> Vec<Case> {
        if pending.is_empty() {
            return pending;
        }

        let now = Utc::now();
        let scored: Vec<(f64, Case)> = pending
            .drain(..)
            .map(|case| {
                let wait_hours = (now - case.created_at).num_seconds() as f64 / 3600.0;
                let score = self.score(case.priority, wait_hours);
                (score, case)
            })
            .collect();

        self.record_metrics(&scored);

        let mut scored = scored;
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.created_at.cmp(&b.1.created_at))
        });

        scored
            .into_iter()
            .take(batch_size)
            .map(|(_, case)| case)
            .collect()
    }

    fn score(&self, priority: CasePriority, wait_hours: f64) -> f64 {
        let starving = priority.is_starvation_eligible() && wait_hours > self.starvation_threshold_hours;

        match self.algorithm {
            SchedulingAlgorithm::StrictPriority => priority.as_i64() as f64,
            SchedulingAlgorithm::Aging => {
                let mut score = priority.as_i64() as f64 + self.aging_factor * wait_hours;
                if starving {
                    score += STARVATION_BOOST;
                }
                score
            }
            SchedulingAlgorithm::WeightedFairQueuing => {
                let mut score = priority.weight() * (1.0 + 0.05 * wait_hours);
                if starving {
                    score *= 2.0;
                }
                score
            }
        }
    }

    fn record_metrics(&self, scored: &[(f64, Case)]) {
        let mut metrics = self.metrics.lock().unwrap();
        let now = Utc::now();
        for (_, case) in scored {
            let wait_hours = (now - case.created_at).num_seconds() as f64 / 3600.0;
            *metrics.cases_by_priority.entry(case.priority).or_insert(0) += 1;
            *metrics
                .total_wait_hours_by_priority
                .entry(case.priority)
                .or_insert(0.0) += wait_hours;

            if case.priority.is_starvation_eligible() && wait_hours > self.starvation_threshold_hours {
                metrics.starvation_prevented += 1;
            }
        }
    }

    pub fn metrics_snapshot(&self) -> SchedulerMetricsSnapshot {
        let metrics = self.metrics.lock().unwrap();
        SchedulerMetricsSnapshot {
            starvation_prevented: metrics.starvation_prevented,
            cases_by_priority: metrics.cases_by_priority.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerMetricsSnapshot {
    pub starvation_prevented: u64,
    pub cases_by_priority: std::collections::HashMap<CasePriority, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CaseStatus;
    use chrono::Duration as ChronoDuration;

    fn case(id: i64, priority: CasePriority, created_at: chrono::DateTime<Utc>) -> Case {
        Case {
            id,
            path: format!("/cases/{id}"),
            status: CaseStatus::Submitted,
            progress: 0,
            priority,
            gpu_group: None,
            remote_task_id: None,
            created_at,
            status_updated_at: created_at,
            completed_at: None,
            final_error: None,
        }
    }

    #[test]
    fn empty_input_returns_empty_without_metrics() {
        let scheduler = PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0);
        let result = scheduler.order(vec![], 4);
        assert!(result.is_empty());
        assert_eq!(scheduler.metrics_snapshot().cases_by_priority.len(), 0);
    }

    #[test]
    fn strict_priority_orders_high_first() {
        let now = Utc::now();
        let scheduler = PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0);
        let cases = vec![
            case(1, CasePriority::Low, now),
            case(2, CasePriority::High, now),
            case(3, CasePriority::Normal, now),
        ];
        let ordered = scheduler.order(cases, 10);
        let ids: Vec<_> = ordered.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn batch_size_truncates() {
        let now = Utc::now();
        let scheduler = PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0);
        let cases = vec![
            case(1, CasePriority::Low, now),
            case(2, CasePriority::High, now),
            case(3, CasePriority::Normal, now),
        ];
        let ordered = scheduler.order(cases, 1);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].id, 2);
    }

    #[test]
    fn aging_boosts_starved_low_priority_case_ahead_of_fresh_normal() {
        let now = Utc::now();
        let old = now - ChronoDuration::hours(10);
        let scheduler = PriorityScheduler::new(SchedulingAlgorithm::Aging, 0.1, 4.0);
        let cases = vec![case(1, CasePriority::Low, old), case(2, CasePriority::Normal, now)];
        let ordered = scheduler.order(cases, 10);
        assert_eq!(ordered[0].id, 1);
        assert!(scheduler.metrics_snapshot().starvation_prevented >= 1);
    }

    #[test]
    fn ties_broken_by_created_at_ascending() {
        let now = Utc::now();
        let earlier = now - ChronoDuration::minutes(5);
        let scheduler = PriorityScheduler::new(SchedulingAlgorithm::StrictPriority, 0.5, 4.0);
        let cases = vec![case(1, CasePriority::Normal, now), case(2, CasePriority::Normal, earlier)];
        let ordered = scheduler.order(cases, 10);
        assert_eq!(ordered[0].id, 2);
    }
}
