use chrono::{DateTime, Utc};
use serde::Serialize;
use siphon_storage::{ControlStore, NewRun, Run, RunFilter, RunState, RunStore, StoreError, TriggerKind};
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::trigger::Trigger;

use super::core::whole_seconds;
use super::Scheduler;

/// Scheduler liveness as reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub healthy: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_tick_age_secs: i64,
    pub threshold_secs: i64,
}

/// Per-task view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub trigger: String,
    pub upstream: Vec<String>,
    pub paused: bool,
    pub last_run: Option<Run>,
}

impl Scheduler {
    /// Queue a manual run of `task` at `logical_ts` (default: now).
    ///
    /// A manual run may repeat a logical timestamp whose earlier run is
    /// terminal, but never one with an active run.
    pub async fn trigger(
        &self,
        task: &str,
        logical_ts: Option<DateTime<Utc>>,
    ) -> Result<Run, SchedulerError> {
        let spec = self
            .graph
            .get(task)
            .ok_or_else(|| SchedulerError::UnknownTask(task.to_string()))?;
        let logical_ts = whole_seconds(logical_ts.unwrap_or_else(Utc::now));
        let anchor = self.anchor(spec);

        let window_start = match &spec.trigger {
            Trigger::Once => spec
                .trigger
                .window_start(anchor, logical_ts, spec.options.backfill_lookback),
            _ => match RunStore::latest_at_or_before(&self.pool, task, logical_ts).await? {
                Some(prev) if prev.logical_ts < logical_ts => prev.logical_ts,
                Some(prev) => prev.window_start,
                None => spec
                    .trigger
                    .window_start(anchor, logical_ts, spec.options.backfill_lookback),
            },
        };

        let new_run = NewRun {
            task_name: task.to_string(),
            logical_ts,
            window_start,
            trigger_kind: TriggerKind::Manual,
        };
        let run = RunStore::insert(&self.pool, &new_run)
            .await?
            .ok_or_else(|| SchedulerError::AlreadyActive {
                task: task.to_string(),
                logical_ts,
            })?;

        info!(task, run_id = run.id, logical_ts = %logical_ts, "manual run queued");
        self.with_metrics(|m| m.record_created(task, 1));
        Ok(run)
    }

    /// Stop scheduling new runs of `task`. Runs already executing finish.
    pub async fn pause(&self, task: &str) -> Result<(), SchedulerError> {
        self.set_paused(task, true).await
    }

    pub async fn resume(&self, task: &str) -> Result<(), SchedulerError> {
        self.set_paused(task, false).await
    }

    async fn set_paused(&self, task: &str, paused: bool) -> Result<(), SchedulerError> {
        if !self.graph.contains(task) {
            return Err(SchedulerError::UnknownTask(task.to_string()));
        }
        ControlStore::set_paused(&self.pool, task, paused).await?;
        info!(task, paused, "task pause state changed");
        Ok(())
    }

    /// Request cancellation of a run.
    ///
    /// Queued and retrying runs fail immediately; a running attempt observes
    /// the request through its cancellation token and is never retried.
    /// Cancelling a terminal run is a no-op.
    pub async fn cancel(&self, run_id: i64) -> Result<Run, SchedulerError> {
        let flagged = match RunStore::request_cancel(&self.pool, run_id).await {
            Ok(flagged) => flagged,
            Err(StoreError::NotFound(_)) => return Err(SchedulerError::RunNotFound(run_id)),
            Err(e) => return Err(e.into()),
        };
        let Some(run) = flagged else {
            return RunStore::get(&self.pool, run_id)
                .await?
                .ok_or(SchedulerError::RunNotFound(run_id));
        };

        info!(task = %run.task_name, run_id, state = %run.state, "cancellation requested");
        let updated = match run.state {
            RunState::Running => {
                self.cancel_local_run(run_id);
                None
            }
            from @ (RunState::Queued | RunState::Retrying) => {
                let failed = RunStore::fail(&self.pool, run_id, from, Utc::now(), "cancelled").await?;
                if failed.is_some() {
                    self.with_metrics(|m| m.record_failed(&run.task_name));
                }
                failed
            }
            _ => None,
        };

        match updated {
            Some(run) => Ok(run),
            None => RunStore::get(&self.pool, run_id)
                .await?
                .ok_or(SchedulerError::RunNotFound(run_id)),
        }
    }

    pub async fn run_history(&self, filter: &RunFilter) -> Result<Vec<Run>, SchedulerError> {
        Ok(RunStore::history(&self.pool, filter).await?)
    }

    /// Settle runs left `running` by a process that died mid-attempt: each
    /// counts as a failed attempt and is retried if its budget allows.
    pub async fn recover_orphans(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let mut recovered = 0;
        for run in RunStore::in_state(&self.pool, RunState::Running).await? {
            let retry = self
                .graph
                .get(&run.task_name)
                .map(|spec| spec.retry)
                .unwrap_or(self.config.retry);
            let reason = "abandoned: scheduler restarted during attempt";
            let updated = if !run.cancel_requested && retry.can_retry(run.attempt) {
                let next = now
                    + chrono::Duration::from_std(retry.delay_for(run.attempt))
                        .unwrap_or_else(|_| chrono::Duration::days(1));
                RunStore::retry(&self.pool, run.id, now, next, reason).await?
            } else {
                RunStore::fail(&self.pool, run.id, RunState::Running, now, reason).await?
            };
            if let Some(updated) = updated {
                warn!(
                    task = %updated.task_name,
                    run_id = updated.id,
                    attempt = updated.attempt,
                    state = %updated.state,
                    "orphaned run recovered"
                );
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness_at(Utc::now())
    }

    /// Healthy while the last tick is younger than `liveness_factor` times
    /// the larger of the tick interval and the shortest trigger period.
    pub fn liveness_at(&self, now: DateTime<Utc>) -> Liveness {
        let tick = chrono::Duration::seconds(self.config.tick_interval_secs.max(1) as i64);
        let shortest = self
            .graph
            .topo_order()
            .filter_map(|t| t.trigger.nominal_period(now))
            .min()
            .unwrap_or(tick);
        let threshold = shortest.max(tick) * self.config.liveness_factor.max(1) as i32;

        let last_tick = self.metrics().last_tick;
        let age = now - last_tick.unwrap_or(self.started_at);
        Liveness {
            healthy: age <= threshold,
            last_tick,
            last_tick_age_secs: age.num_seconds(),
            threshold_secs: threshold.num_seconds(),
        }
    }

    /// Registered tasks in dependency order with their pause flag and most
    /// recent run.
    pub async fn task_statuses(&self) -> Result<Vec<TaskStatus>, SchedulerError> {
        let paused = ControlStore::paused(&self.pool).await?;
        let mut statuses = Vec::with_capacity(self.graph.len());
        for spec in self.graph.topo_order() {
            let filter = RunFilter {
                task: Some(spec.name.clone()),
                limit: Some(1),
                ..Default::default()
            };
            let last_run = RunStore::history(&self.pool, &filter).await?.into_iter().next();
            statuses.push(TaskStatus {
                name: spec.name.clone(),
                trigger: spec.trigger.to_string(),
                upstream: spec.upstream.clone(),
                paused: paused.contains(&spec.name),
                last_run,
            });
        }
        Ok(statuses)
    }
}
