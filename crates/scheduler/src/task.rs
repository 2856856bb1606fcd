use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::retry::RetryPolicy;
use crate::trigger::Trigger;

/// How upstream outcomes gate a downstream run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Every upstream run succeeded. A terminally failed or skipped upstream
    /// skips the downstream run.
    #[default]
    AllSuccess,
    /// Every upstream run is terminal, whatever its outcome.
    AllDone,
}

/// Scheduling knobs for a task.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// No logical timestamp before this is scheduled. Defaults to the
    /// scheduler's start time.
    pub start_date: Option<DateTime<Utc>>,
    /// Create every missed logical timestamp, or only the latest one.
    pub catchup: bool,
    pub max_active_runs: u32,
    /// Per-attempt execution timeout.
    pub timeout: Duration,
    pub trigger_rule: TriggerRule,
    /// Fetch window for one-shot runs, counted back from `start_date`.
    pub backfill_lookback: Option<chrono::Duration>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            start_date: None,
            catchup: true,
            max_active_runs: 16,
            timeout: Duration::from_secs(300),
            trigger_rule: TriggerRule::AllSuccess,
            backfill_lookback: None,
        }
    }
}

/// Static definition of a task: identity, cadence, retries and upstream edges.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub trigger: Trigger,
    pub retry: RetryPolicy,
    pub upstream: Vec<String>,
    pub options: TaskOptions,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            trigger,
            retry: RetryPolicy::default(),
            upstream: Vec::new(),
            options: TaskOptions::default(),
        }
    }

    pub fn depends_on(mut self, upstream: impl Into<String>) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn starting_at(mut self, start_date: DateTime<Utc>) -> Self {
        self.options.start_date = Some(start_date);
        self
    }
}

/// Everything an action needs to know about the attempt it is running.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: i64,
    pub task_name: String,
    pub logical_ts: DateTime<Utc>,
    /// Fetch window is `[window_start, logical_ts)`.
    pub window_start: DateTime<Utc>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when an operator cancels the run. Actions check it at every
    /// network call boundary.
    pub cancel: CancellationToken,
}

impl RunContext {
    /// `Err(TaskError::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Outcome of a successful attempt, stored as the run summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Items the action handled (e.g. records published).
    pub processed: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

/// The work a task performs for one logical timestamp.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self, ctx: RunContext) -> Result<RunResult, TaskError>;
}

#[async_trait]
impl<T: TaskAction + ?Sized> TaskAction for Arc<T> {
    async fn run(&self, ctx: RunContext) -> Result<RunResult, TaskError> {
        (**self).run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_upstream() {
        let spec = TaskSpec::new("harvest", Trigger::Once)
            .depends_on("backfill")
            .depends_on("schema");
        assert_eq!(spec.upstream, vec!["backfill", "schema"]);
        assert_eq!(spec.options.max_active_runs, 16);
        assert!(spec.options.catchup);
    }

    #[test]
    fn trigger_rule_names() {
        let rule: TriggerRule = serde_json::from_str("\"all_done\"").unwrap();
        assert_eq!(rule, TriggerRule::AllDone);
        assert_eq!(TriggerRule::default(), TriggerRule::AllSuccess);
    }

    #[test]
    fn check_cancelled() {
        let ctx = RunContext {
            run_id: 1,
            task_name: "t".into(),
            logical_ts: Utc::now(),
            window_start: Utc::now(),
            attempt: 1,
            cancel: CancellationToken::new(),
        };
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel.cancel();
        assert_eq!(ctx.check_cancelled(), Err(TaskError::Cancelled));
    }
}
