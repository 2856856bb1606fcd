use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational metrics exposed on the admin surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Runs created per task (scheduled and manual).
    pub runs_created: HashMap<String, u64>,
    pub runs_succeeded: HashMap<String, u64>,
    pub runs_failed: HashMap<String, u64>,
    /// Failed attempts that were put back for another try.
    pub runs_retried: HashMap<String, u64>,
    pub runs_skipped: HashMap<String, u64>,
    /// Average attempt duration by task name.
    pub avg_attempt_duration: HashMap<String, Duration>,
    pub attempts: HashMap<String, u64>,
    /// Last successful tick.
    pub last_tick: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub active_workers: usize,
    pub worker_pool_size: usize,
}

fn bump(map: &mut HashMap<String, u64>, task: &str, n: u64) {
    *map.entry(task.to_string()).or_default() += n;
}

impl SchedulerMetrics {
    pub fn record_created(&mut self, task: &str, n: u64) {
        if n > 0 {
            bump(&mut self.runs_created, task, n);
        }
    }

    pub fn record_succeeded(&mut self, task: &str) {
        bump(&mut self.runs_succeeded, task, 1);
    }

    pub fn record_failed(&mut self, task: &str) {
        bump(&mut self.runs_failed, task, 1);
    }

    pub fn record_retried(&mut self, task: &str) {
        bump(&mut self.runs_retried, task, 1);
    }

    pub fn record_skipped(&mut self, task: &str) {
        bump(&mut self.runs_skipped, task, 1);
    }

    pub fn record_tick(&mut self, at: DateTime<Utc>) {
        self.ticks += 1;
        self.last_tick = Some(at);
    }

    /// Record an attempt's wall time.
    pub fn record_attempt(&mut self, task: &str, duration: Duration) {
        bump(&mut self.attempts, task, 1);
        let count = self.attempts[task];
        let prev_avg = self
            .avg_attempt_duration
            .get(task)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        self.avg_attempt_duration.insert(task.to_string(), new_avg);
    }
}
