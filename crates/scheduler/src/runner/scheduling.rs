use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use siphon_storage::{ControlStore, NewRun, Run, RunState, RunStore, TriggerKind};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::task::{TaskSpec, TriggerRule};
use crate::trigger::Trigger;

use super::Scheduler;

/// What a tick created.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub created: Vec<Run>,
    /// Paused tasks that were not scheduled.
    pub paused: Vec<String>,
}

/// Whether a queued run's upstream runs allow it to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    Waiting,
    Blocked(String),
}

impl Scheduler {
    /// Create queued runs for every due, not-yet-scheduled logical timestamp
    /// `<= now`. Safe to call concurrently and repeatedly: uniqueness is
    /// enforced by the state store.
    pub async fn schedule_tick(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let paused = ControlStore::paused(&self.pool).await?;
        let mut report = TickReport::default();

        for spec in self.graph.topo_order() {
            if paused.contains(&spec.name) {
                report.paused.push(spec.name.clone());
                continue;
            }
            let anchor = self.anchor(spec);
            let latest = RunStore::latest_scheduled_ts(&self.pool, &spec.name).await?;
            let due: Vec<DateTime<Utc>> = if spec.options.catchup {
                spec.trigger
                    .fire_times(anchor, latest, now)
                    .take(self.config.max_catchup_runs.max(1))
                    .collect()
            } else {
                spec.trigger.latest_fire(anchor, latest, now).into_iter().collect()
            };

            let mut previous = latest;
            let mut created = 0;
            for logical_ts in due {
                let window_start = match (&spec.trigger, previous) {
                    (Trigger::Once, _) | (_, None) => spec.trigger.window_start(
                        anchor,
                        logical_ts,
                        spec.options.backfill_lookback,
                    ),
                    (_, Some(prev)) => prev,
                };
                let new_run = NewRun {
                    task_name: spec.name.clone(),
                    logical_ts,
                    window_start,
                    trigger_kind: TriggerKind::Scheduled,
                };
                if let Some(run) = RunStore::insert_scheduled(&self.pool, &new_run).await? {
                    info!(
                        task = %spec.name,
                        run_id = run.id,
                        logical_ts = %logical_ts,
                        "run queued"
                    );
                    report.created.push(run);
                    created += 1;
                }
                previous = Some(logical_ts);
            }
            self.with_metrics(|m| m.record_created(&spec.name, created));
        }

        self.with_metrics(|m| m.record_tick(Utc::now()));
        Ok(report)
    }

    /// Move retrying runs whose backoff elapsed back to `queued`.
    pub async fn promote_retries(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let mut promoted = 0;
        for run in RunStore::due_retries(&self.pool, now).await? {
            if run.cancel_requested {
                if RunStore::fail(&self.pool, run.id, RunState::Retrying, now, "cancelled")
                    .await?
                    .is_some()
                {
                    self.with_metrics(|m| m.record_failed(&run.task_name));
                }
                continue;
            }
            if RunStore::requeue(&self.pool, run.id).await?.is_some() {
                debug!(task = %run.task_name, run_id = run.id, attempt = run.attempt, "run requeued");
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Start every queued run whose upstreams allow it, up to the free worker
    /// capacity. Executions are spawned onto `inflight`; returns how many
    /// were started.
    pub async fn dispatch(
        self: &Arc<Self>,
        inflight: &mut JoinSet<()>,
    ) -> Result<usize, SchedulerError> {
        let paused = ControlStore::paused(&self.pool).await?;
        let mut queued = RunStore::in_state(&self.pool, RunState::Queued).await?;
        queued.sort_by_key(|r| (r.logical_ts, self.graph.rank(&r.task_name), r.id));

        let mut started = 0;
        for run in queued {
            let Some(spec) = self.graph.get(&run.task_name) else {
                debug!(task = %run.task_name, run_id = run.id, "queued run for unregistered task");
                continue;
            };
            if paused.contains(&spec.name) {
                continue;
            }
            if run.cancel_requested {
                if RunStore::fail(&self.pool, run.id, RunState::Queued, Utc::now(), "cancelled")
                    .await?
                    .is_some()
                {
                    self.with_metrics(|m| m.record_failed(&spec.name));
                }
                continue;
            }

            match self.readiness(spec, &run).await? {
                Readiness::Ready => {}
                Readiness::Waiting => continue,
                Readiness::Blocked(reason) => {
                    if RunStore::skip(&self.pool, run.id, Utc::now(), &reason).await?.is_some() {
                        warn!(task = %spec.name, run_id = run.id, reason = %reason, "run skipped");
                        self.with_metrics(|m| m.record_skipped(&spec.name));
                    }
                    continue;
                }
            }

            if RunStore::count_running(&self.pool, &spec.name).await? >= spec.options.max_active_runs {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                debug!("worker pool saturated");
                break;
            };
            let Some(run) = RunStore::start(&self.pool, run.id, Utc::now()).await? else {
                continue;
            };

            started += 1;
            let this = Arc::clone(self);
            inflight.spawn(async move {
                let _permit = permit;
                let (task, run_id) = (run.task_name.clone(), run.id);
                if let Err(e) = this.execute(run).await {
                    error!(task = %task, run_id, error = %e, "run execution failed");
                }
            });
        }
        Ok(started)
    }

    /// Upstream gate for a run at logical timestamp T: each upstream task's
    /// most recent run with logical timestamp `<= T` decides.
    pub(crate) async fn readiness(
        &self,
        spec: &TaskSpec,
        run: &Run,
    ) -> Result<Readiness, SchedulerError> {
        for upstream in &spec.upstream {
            let Some(up) = RunStore::latest_at_or_before(&self.pool, upstream, run.logical_ts).await?
            else {
                return Ok(Readiness::Waiting);
            };
            match up.state {
                RunState::Success => {}
                state if state.is_terminal() => {
                    if spec.options.trigger_rule == TriggerRule::AllSuccess {
                        return Ok(Readiness::Blocked(format!(
                            "upstream '{}' {} at {}",
                            upstream, state, up.logical_ts
                        )));
                    }
                }
                _ => return Ok(Readiness::Waiting),
            }
        }
        Ok(Readiness::Ready)
    }

    /// One scheduling pass: create due runs, requeue due retries, dispatch.
    pub async fn tick(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        inflight: &mut JoinSet<()>,
    ) -> Result<TickReport, SchedulerError> {
        let report = self.schedule_tick(now).await?;
        self.promote_retries(Utc::now()).await?;
        self.dispatch(inflight).await?;
        Ok(report)
    }

    /// Tick once, then keep dispatching and awaiting runs until nothing else
    /// can start. Used by one-shot invocations and tests.
    pub async fn run_pending(self: &Arc<Self>, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let report = self.schedule_tick(now).await?;
        loop {
            self.promote_retries(Utc::now()).await?;
            let mut inflight = JoinSet::new();
            if self.dispatch(&mut inflight).await? == 0 {
                break;
            }
            while let Some(joined) = inflight.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "run execution task panicked");
                }
            }
        }
        Ok(report)
    }
}
