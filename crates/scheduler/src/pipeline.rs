//! Pipeline definition files.
//!
//! A pipeline file lists tasks as TOML tables:
//!
//! ```toml
//! [scheduler]
//! worker_pool_size = 4
//!
//! [[task]]
//! name = "backfill-rust"
//! action = "produce"
//! collection = "rust"
//! once = true
//! start_date = "2024-05-01T00:00:00Z"
//!
//! [[task]]
//! name = "harvest-rust"
//! action = "produce"
//! collection = "rust"
//! cron = "0 * * * *"
//! depends_on = ["backfill-rust"]
//! ```
//!
//! `action` names the kind of work; the binary maps it to a [`TaskAction`]
//! implementation.
//!
//! [`TaskAction`]: crate::task::TaskAction

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::retry::RetryPolicy;
use crate::task::{TaskOptions, TaskSpec, TriggerRule};
use crate::trigger::Trigger;

/// Action name for producer tasks.
pub const PRODUCE_ACTION: &str = "produce";

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskDef {
    pub name: String,
    pub action: String,
    /// Source collection for producer actions.
    pub collection: Option<String>,

    // Exactly one trigger kind.
    pub cron: Option<String>,
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub once: bool,

    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depends_on: Vec<String>,

    pub max_attempts: Option<u32>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_cap_secs: Option<u64>,

    #[serde(default = "default_true")]
    pub catchup: bool,
    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub trigger_rule: TriggerRule,
    pub backfill_lookback_secs: Option<i64>,
}

fn default_true() -> bool { true }
fn default_max_active_runs() -> u32 { 16 }
fn default_timeout_secs() -> u64 { 300 }

impl TaskDef {
    fn trigger(&self) -> Result<Trigger, SchedulerError> {
        let invalid = |reason: String| SchedulerError::InvalidTrigger {
            task: self.name.clone(),
            reason,
        };
        match (&self.cron, self.interval_secs, self.once) {
            (Some(expr), None, false) => {
                Trigger::cron(expr).map_err(|e| invalid(format!("cron '{expr}': {e}")))
            }
            (None, Some(secs), false) => i64::try_from(secs)
                .ok()
                .and_then(|s| Trigger::every(chrono::Duration::seconds(s)))
                .ok_or_else(|| invalid(format!("interval_secs must be positive, got {secs}"))),
            (None, None, true) => Ok(Trigger::Once),
            _ => Err(invalid(
                "set exactly one of `cron`, `interval_secs` or `once = true`".into(),
            )),
        }
    }

    /// Build the task spec, filling unset retry fields from `defaults`.
    pub fn to_spec(&self, defaults: &RetryPolicy) -> Result<TaskSpec, SchedulerError> {
        let retry = RetryPolicy::new(
            self.max_attempts.unwrap_or(defaults.max_attempts),
            self.backoff_base_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff_base),
            self.backoff_cap_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff_cap),
        );
        let options = TaskOptions {
            start_date: self.start_date,
            catchup: self.catchup,
            max_active_runs: self.max_active_runs.max(1),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            trigger_rule: self.trigger_rule,
            backfill_lookback: self.backfill_lookback_secs.map(chrono::Duration::seconds),
        };
        Ok(TaskSpec {
            name: self.name.clone(),
            trigger: self.trigger()?,
            retry,
            upstream: self.depends_on.clone(),
            options,
        })
    }
}

impl PipelineFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Pipeline(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, SchedulerError> {
        toml::from_str(text).map_err(|e| SchedulerError::Pipeline(e.to_string()))
    }

    /// One producer task pair per collection: a one-shot historical backfill
    /// feeding an hourly harvest.
    pub fn default_for(collections: &[String], start_date: DateTime<Utc>) -> Self {
        let mut tasks = Vec::with_capacity(collections.len() * 2);
        for collection in collections {
            let backfill = format!("backfill-{collection}");
            tasks.push(TaskDef::produce(&backfill, collection, start_date));
            let mut harvest = TaskDef::produce(&format!("harvest-{collection}"), collection, start_date);
            harvest.once = false;
            harvest.cron = Some("0 * * * *".into());
            harvest.depends_on = vec![backfill];
            tasks.push(harvest);
        }
        Self {
            scheduler: None,
            tasks,
        }
    }

    pub fn specs(&self, defaults: &RetryPolicy) -> Result<Vec<TaskSpec>, SchedulerError> {
        self.tasks.iter().map(|t| t.to_spec(defaults)).collect()
    }
}

impl TaskDef {
    fn produce(name: &str, collection: &str, start_date: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            action: PRODUCE_ACTION.to_string(),
            collection: Some(collection.to_string()),
            cron: None,
            interval_secs: None,
            once: true,
            start_date: Some(start_date),
            depends_on: Vec::new(),
            max_attempts: None,
            backoff_base_secs: None,
            backoff_cap_secs: None,
            catchup: true,
            max_active_runs: default_max_active_runs(),
            timeout_secs: default_timeout_secs(),
            trigger_rule: TriggerRule::AllSuccess,
            backfill_lookback_secs: None,
        }
    }
}
