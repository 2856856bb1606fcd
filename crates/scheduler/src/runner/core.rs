use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use siphon_storage::SqlitePool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::graph::TaskGraph;
use crate::metrics::SchedulerMetrics;
use crate::task::{TaskAction, TaskSpec};

/// The run scheduler.
///
/// Owns the validated task graph and the registered actions; all run state
/// lives in the state store, so a restarted scheduler picks up where the
/// previous one stopped.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) pool: SqlitePool,
    pub(super) graph: TaskGraph,
    pub(super) actions: HashMap<String, Arc<dyn TaskAction>>,
    /// Bounds concurrent executions.
    pub(super) workers: Arc<Semaphore>,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    /// Cancellation handles of runs executing in this process.
    pub(super) running: Arc<Mutex<HashMap<i64, CancellationToken>>>,
    /// Anchor for tasks without a start date.
    pub(super) started_at: DateTime<Utc>,
}

impl Scheduler {
    /// Validate the task graph and bind each task to its action.
    pub fn new(
        config: SchedulerConfig,
        pool: SqlitePool,
        tasks: Vec<(TaskSpec, Arc<dyn TaskAction>)>,
    ) -> Result<Self, SchedulerError> {
        let mut specs = Vec::with_capacity(tasks.len());
        let mut actions = HashMap::with_capacity(tasks.len());
        for (spec, action) in tasks {
            actions.insert(spec.name.clone(), action);
            specs.push(spec);
        }
        let graph = TaskGraph::new(specs)?;
        if let Some(missing) = graph.topo_order().find(|t| !actions.contains_key(&t.name)) {
            return Err(SchedulerError::MissingAction(missing.name.clone()));
        }

        for task in graph.topo_order() {
            info!(
                task = %task.name,
                trigger = %task.trigger,
                upstream = ?task.upstream,
                max_attempts = task.retry.max_attempts,
                "registered task"
            );
        }

        let metrics = SchedulerMetrics {
            worker_pool_size: config.worker_pool_size,
            ..Default::default()
        };
        Ok(Self {
            workers: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            config,
            pool,
            graph,
            actions,
            metrics: Arc::new(RwLock::new(metrics)),
            running: Arc::new(Mutex::new(HashMap::new())),
            started_at: whole_seconds(Utc::now()),
        })
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let mut snapshot = match self.metrics.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        snapshot.active_workers = self
            .config
            .worker_pool_size
            .saturating_sub(self.workers.available_permits());
        snapshot
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(super) fn anchor(&self, spec: &TaskSpec) -> DateTime<Utc> {
        spec.options.start_date.unwrap_or(self.started_at)
    }

    pub(super) fn with_metrics(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        if let Ok(mut m) = self.metrics.write() {
            f(&mut m);
        }
    }
}

/// Drop sub-second precision; logical timestamps are whole seconds.
pub(crate) fn whole_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}
