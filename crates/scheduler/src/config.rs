use std::time::Duration;

use serde::{Deserialize, Serialize};
use siphon_core::config::SchedulerSettings;

use crate::retry::RetryPolicy;

/// Scheduler configuration, read from the environment or a pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Concurrent run executions.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Liveness fails when the last tick is older than this many times the
    /// shortest trigger period.
    #[serde(default = "default_liveness_factor")]
    pub liveness_factor: u32,
    /// Logical timestamps a single tick may create per task.
    #[serde(default = "default_max_catchup_runs")]
    pub max_catchup_runs: usize,
    /// Policy for tasks that do not set their own.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// How often a running attempt re-reads its cancellation flag.
    #[serde(default = "default_cancel_poll_ms")]
    pub cancel_poll_ms: u64,
    /// How long in-flight runs get to finish after shutdown before they are
    /// abandoned to crash recovery.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_tick_interval_secs() -> u64 { 30 }
fn default_worker_pool_size() -> usize { 4 }
fn default_liveness_factor() -> u32 { 3 }
fn default_max_catchup_runs() -> usize { 100 }
fn default_cancel_poll_ms() -> u64 { 1000 }
fn default_shutdown_grace_ms() -> u64 { 30_000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            worker_pool_size: default_worker_pool_size(),
            liveness_factor: default_liveness_factor(),
            max_catchup_runs: default_max_catchup_runs(),
            retry: RetryPolicy::default(),
            cancel_poll_ms: default_cancel_poll_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            tick_interval_secs: settings.tick_interval_secs.max(1),
            worker_pool_size: settings.worker_pool_size.max(1),
            liveness_factor: settings.liveness_factor.max(1),
            max_catchup_runs: settings.max_catchup_runs.max(1),
            retry: RetryPolicy::new(
                settings.max_attempts,
                Duration::from_secs(settings.backoff_base_secs),
                Duration::from_secs(settings.backoff_cap_secs),
            ),
            ..Self::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms.max(10))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_defaults() {
        let config: SchedulerConfig = toml::from_str("worker_pool_size = 8").unwrap();
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.tick_interval_secs, 30);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn from_env_settings() {
        let settings = siphon_core::Config::for_profile("").scheduler;
        let config = SchedulerConfig::from_settings(&settings);
        assert_eq!(config.retry.max_attempts, settings.max_attempts.max(1));
        assert_eq!(config.tick_interval(), Duration::from_secs(settings.tick_interval_secs.max(1)));
    }
}
