//! Execution counters and running averages.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Point-in-time copy of the pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    /// Executions admitted so far, including ones still running.
    pub total_executions: u64,
    pub completed_processes: u64,
    pub failed_processes: u64,
    /// Running mean, in milliseconds, over completed and failed executions.
    pub average_execution_time: f64,
    /// Current registry size.
    pub active_processes: usize,
    /// Set once the registry has ever been full; never cleared.
    pub max_concurrent_reached: bool,
}

/// Whether a terminal outcome counts as completed or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The process ran to exit, whatever its exit code.
    Completed,
    /// Spawn failure, timeout, kill or abandonment.
    Failed,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    completed: u64,
    failed: u64,
    average_ms: f64,
    max_concurrent_reached: bool,
}

/// Accumulates [`ProcessMetrics`]; a no-op when disabled.
#[derive(Debug)]
pub struct MetricsAggregator {
    enabled: bool,
    counters: Mutex<Counters>,
}

impl MetricsAggregator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Count an execution at admission time.
    pub fn record_admission(&self) {
        if self.enabled {
            self.counters.lock().total += 1;
        }
    }

    /// Count a terminal outcome and fold its duration into the average.
    pub fn record_completion(&self, completion: Completion, duration: Duration) {
        if !self.enabled {
            return;
        }
        let mut c = self.counters.lock();
        match completion {
            Completion::Completed => c.completed += 1,
            Completion::Failed => c.failed += 1,
        }
        #[allow(clippy::cast_precision_loss)]
        let finished = (c.completed + c.failed) as f64;
        let sample = duration.as_secs_f64() * 1000.0;
        c.average_ms += (sample - c.average_ms) / finished;
    }

    pub fn mark_max_concurrent_reached(&self) {
        if self.enabled {
            self.counters.lock().max_concurrent_reached = true;
        }
    }

    /// Copy the counters out, pairing them with the live registry size.
    pub fn snapshot(&self, active_processes: usize) -> ProcessMetrics {
        let c = self.counters.lock();
        ProcessMetrics {
            total_executions: c.total,
            completed_processes: c.completed,
            failed_processes: c.failed,
            average_execution_time: c.average_ms,
            active_processes,
            max_concurrent_reached: c.max_concurrent_reached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_over_both_outcomes() {
        let metrics = MetricsAggregator::new(true);
        metrics.record_admission();
        metrics.record_admission();
        metrics.record_completion(Completion::Completed, Duration::from_millis(100));
        metrics.record_completion(Completion::Failed, Duration::from_millis(300));

        let snap = metrics.snapshot(0);
        assert_eq!(snap.total_executions, 2);
        assert_eq!(snap.completed_processes, 1);
        assert_eq!(snap.failed_processes, 1);
        assert!((snap.average_execution_time - 200.0).abs() < 1e-9);
    }

    #[test]
    fn admission_counts_before_completion() {
        let metrics = MetricsAggregator::new(true);
        metrics.record_admission();
        let snap = metrics.snapshot(1);
        assert_eq!(snap.total_executions, 1);
        assert_eq!(snap.completed_processes + snap.failed_processes, 0);
        assert_eq!(snap.active_processes, 1);
    }

    #[test]
    fn max_concurrent_flag_is_sticky() {
        let metrics = MetricsAggregator::new(true);
        metrics.mark_max_concurrent_reached();
        metrics.record_completion(Completion::Completed, Duration::from_millis(1));
        assert!(metrics.snapshot(0).max_concurrent_reached);
    }

    #[test]
    fn disabled_aggregator_records_nothing() {
        let metrics = MetricsAggregator::new(false);
        metrics.record_admission();
        metrics.record_completion(Completion::Failed, Duration::from_secs(1));
        metrics.mark_max_concurrent_reached();
        let snap = metrics.snapshot(2);
        assert_eq!(
            snap,
            ProcessMetrics {
                active_processes: 2,
                ..ProcessMetrics::default()
            }
        );
    }

    #[test]
    fn snapshot_is_a_copy() {
        let metrics = MetricsAggregator::new(true);
        let before = metrics.snapshot(0);
        metrics.record_admission();
        assert_eq!(before.total_executions, 0);
        assert_eq!(metrics.snapshot(0).total_executions, 1);
    }
}
