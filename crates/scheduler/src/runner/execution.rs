use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use siphon_storage::{Run, RunState, RunStore, SqlitePool};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, TaskError};
use crate::task::{RunContext, RunResult, TaskSpec};

use super::Scheduler;

impl Scheduler {
    /// Drive the scheduler until `shutdown` fires.
    ///
    /// Ticks every `tick_interval`; a finished run also triggers a dispatch
    /// pass so that downstream tasks and retries start without waiting for
    /// the next tick.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        let recovered = self.recover_orphans().await?;
        if recovered > 0 {
            warn!(recovered, "recovered runs left running by a previous process");
        }

        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut inflight: JoinSet<()> = JoinSet::new();

        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            worker_pool_size = self.config.worker_pool_size,
            tasks = self.graph.len(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(Utc::now(), &mut inflight).await {
                        Ok(report) if !report.created.is_empty() => {
                            debug!(created = report.created.len(), "tick complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "run execution task panicked");
                    }
                    let pass = async {
                        self.promote_retries(Utc::now()).await?;
                        self.dispatch(&mut inflight).await
                    };
                    if let Err(e) = pass.await {
                        error!(error = %e, "dispatch after completion failed");
                    }
                }
            }
        }

        info!(inflight = inflight.len(), "scheduler stopping");
        let drain = async {
            while inflight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace(), drain).await.is_err() {
            // Aborted attempts stay `running` and are recovered as orphans on
            // the next start, like after a crash.
            warn!(
                inflight = inflight.len(),
                "in-flight runs did not finish in time; abandoning them"
            );
            inflight.shutdown().await;
            self.forget_local();
        }
        Ok(())
    }

    /// Execute one attempt of a run already moved to `running`, then record
    /// the outcome. Returns the run as stored afterwards.
    pub(crate) async fn execute(&self, run: Run) -> Result<Run, SchedulerError> {
        let spec = self
            .graph
            .get(&run.task_name)
            .ok_or_else(|| SchedulerError::UnknownTask(run.task_name.clone()))?;
        let action = self
            .actions
            .get(&run.task_name)
            .cloned()
            .ok_or_else(|| SchedulerError::MissingAction(run.task_name.clone()))?;

        let token = CancellationToken::new();
        if run.cancel_requested {
            token.cancel();
        }
        self.register(run.id, token.clone());
        let watcher = AbortOnDrop(tokio::spawn(watch_cancel(
            self.pool.clone(),
            run.id,
            token.clone(),
            self.config.cancel_poll_interval(),
        )));

        let ctx = RunContext {
            run_id: run.id,
            task_name: run.task_name.clone(),
            logical_ts: run.logical_ts,
            window_start: run.window_start,
            attempt: run.attempt,
            cancel: token.clone(),
        };

        info!(
            task = %run.task_name,
            run_id = run.id,
            attempt = run.attempt,
            logical_ts = %run.logical_ts,
            window_start = %run.window_start,
            "attempt started"
        );
        let started = Instant::now();
        let outcome = match tokio::time::timeout(spec.options.timeout, action.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(TaskError::Timeout(spec.options.timeout))
            }
        };
        let outcome = match outcome {
            Err(TaskError::Timeout(d)) => Err(TaskError::Timeout(d)),
            Err(_) if token.is_cancelled() => Err(TaskError::Cancelled),
            other => other,
        };
        let elapsed = started.elapsed();

        drop(watcher);
        self.unregister(run.id);
        self.with_metrics(|m| m.record_attempt(&run.task_name, elapsed));

        self.finish(spec, &run, outcome, elapsed).await
    }

    /// Record the outcome of an attempt as the run's next state.
    async fn finish(
        &self,
        spec: &TaskSpec,
        run: &Run,
        outcome: Result<RunResult, TaskError>,
        elapsed: Duration,
    ) -> Result<Run, SchedulerError> {
        let now = Utc::now();
        let updated = match outcome {
            Ok(result) => {
                let summary = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
                let updated = RunStore::succeed(&self.pool, run.id, now, summary).await?;
                if updated.is_some() {
                    info!(
                        task = %run.task_name,
                        run_id = run.id,
                        attempt = run.attempt,
                        processed = result.processed,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "run succeeded"
                    );
                    self.with_metrics(|m| m.record_succeeded(&run.task_name));
                }
                updated
            }
            Err(e) if e.is_retryable() && spec.retry.can_retry(run.attempt) => {
                let delay = spec.retry.delay_for(run.attempt);
                let next = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
                let updated = RunStore::retry(&self.pool, run.id, now, next, &e.to_string()).await?;
                if updated.is_some() {
                    warn!(
                        task = %run.task_name,
                        run_id = run.id,
                        attempt = run.attempt,
                        max_attempts = spec.retry.max_attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "attempt failed; will retry"
                    );
                    self.with_metrics(|m| m.record_retried(&run.task_name));
                }
                updated
            }
            Err(e) => {
                let updated =
                    RunStore::fail(&self.pool, run.id, RunState::Running, now, &e.to_string())
                        .await?;
                if updated.is_some() {
                    error!(
                        task = %run.task_name,
                        run_id = run.id,
                        attempt = run.attempt,
                        error = %e,
                        "run failed"
                    );
                    self.with_metrics(|m| m.record_failed(&run.task_name));
                }
                updated
            }
        };

        match updated {
            Some(run) => Ok(run),
            None => RunStore::get(&self.pool, run.id)
                .await?
                .ok_or(SchedulerError::RunNotFound(run.id)),
        }
    }

    fn register(&self, run_id: i64, token: CancellationToken) {
        if let Ok(mut running) = self.running.lock() {
            running.insert(run_id, token);
        }
    }

    fn unregister(&self, run_id: i64) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&run_id);
        }
    }

    /// Cancel the local token of a run executing in this process.
    pub(super) fn cancel_local_run(&self, run_id: i64) -> bool {
        match self.running.lock() {
            Ok(running) => running.get(&run_id).map(|t| t.cancel()).is_some(),
            Err(_) => false,
        }
    }

    fn forget_local(&self) {
        if let Ok(mut running) = self.running.lock() {
            running.clear();
        }
    }
}

/// Aborts the wrapped task when dropped, also when the attempt owning it is
/// itself aborted.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Propagate a cancellation request recorded in the store (possibly by
/// another process) to the attempt's token.
async fn watch_cancel(pool: SqlitePool, run_id: i64, token: CancellationToken, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {
                match RunStore::is_cancel_requested(&pool, run_id).await {
                    Ok(true) => {
                        debug!(run_id, "cancellation requested");
                        token.cancel();
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(run_id, error = %e, "failed to read cancellation flag"),
                }
            }
        }
    }
}
