//! Run lifecycle persistence for the `runs` table.
//!
//! [`RunStore`] is a stateless unit struct with async methods that take a
//! `&SqlitePool`. Every state change is a compare-and-set on the current
//! state, so a terminal run can never be rewritten and two schedulers racing
//! on the same run cannot both win.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::{from_millis, opt_from_millis, to_millis};
use crate::error::{map_constraint, StoreError};

// ── Run state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Success,
    Failed,
    Retrying,
    Skipped,
}

impl RunState {
    pub const ALL: [RunState; 6] = [
        Self::Queued,
        Self::Running,
        Self::Success,
        Self::Failed,
        Self::Retrying,
        Self::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    /// Edges of the run state machine.
    ///
    /// `queued -> failed` and `retrying -> failed` are cancellation paths;
    /// `retrying -> failed` is also taken when a retry can no longer run.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Skipped)
                | (Queued, Failed)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Queued)
                | (Retrying, Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StoreError::Decode(format!("unknown run state '{s}'")))
    }
}

/// How a run came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            other => Err(StoreError::Decode(format!("unknown trigger kind '{other}'"))),
        }
    }
}

// ── Row types ───────────────────────────────────────────────────────

/// One execution instance of a task for a logical timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub id: i64,
    pub task_name: String,
    pub logical_ts: DateTime<Utc>,
    /// Start of the fetch window; the window is `[window_start, logical_ts)`.
    pub window_start: DateTime<Utc>,
    pub state: RunState,
    pub attempt: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub summary: Option<serde_json::Value>,
    pub trigger_kind: TriggerKind,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: i64,
    task_name: String,
    logical_ts: i64,
    window_start: i64,
    state: String,
    attempt: i64,
    next_attempt_at: Option<i64>,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    error: Option<String>,
    summary: Option<String>,
    trigger_kind: String,
    cancel_requested: bool,
    created_at: i64,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let summary = row
            .summary
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Decode(format!("run {} summary: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            task_name: row.task_name,
            logical_ts: from_millis(row.logical_ts)?,
            window_start: from_millis(row.window_start)?,
            state: row.state.parse()?,
            attempt: u32::try_from(row.attempt).unwrap_or(0),
            next_attempt_at: opt_from_millis(row.next_attempt_at)?,
            started_at: opt_from_millis(row.started_at)?,
            ended_at: opt_from_millis(row.ended_at)?,
            error: row.error,
            summary,
            trigger_kind: row.trigger_kind.parse()?,
            cancel_requested: row.cancel_requested,
            created_at: from_millis(row.created_at)?,
        })
    }
}

fn decode_all(rows: Vec<RunRow>) -> Result<Vec<Run>, StoreError> {
    rows.into_iter().map(Run::try_from).collect()
}

// ── Request types ───────────────────────────────────────────────────

/// A run to be created in `queued`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub task_name: String,
    pub logical_ts: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub trigger_kind: TriggerKind,
}

/// Column changes applied together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub bump_attempt: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Written as-is: `None` clears the column.
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub summary: Option<serde_json::Value>,
    /// Written as-is: `None` clears the column.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Filter for the run-history query. Time bounds are inclusive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunFilter {
    pub task: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub state: Option<RunState>,
    pub limit: Option<u32>,
}

// ── Store ───────────────────────────────────────────────────────────

/// Stateless store for `runs`.
pub struct RunStore;

impl RunStore {
    /// Create a scheduled run unless any run already exists for the same
    /// (task, logical timestamp). Returns `None` when nothing was created.
    ///
    /// The `NOT EXISTS` guard keeps ticks from re-creating finished
    /// instances; the partial unique index serializes concurrent inserts.
    pub async fn insert_scheduled(
        pool: &SqlitePool,
        run: &NewRun,
    ) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "INSERT INTO runs (task_name, logical_ts, window_start, state, trigger_kind, created_at)
             SELECT ?1, ?2, ?3, 'queued', 'scheduled', ?4
             WHERE NOT EXISTS (
                 SELECT 1 FROM runs WHERE task_name = ?1 AND logical_ts = ?2
             )
             ON CONFLICT DO NOTHING
             RETURNING *",
        )
        .bind(&run.task_name)
        .bind(to_millis(run.logical_ts))
        .bind(to_millis(run.window_start))
        .bind(to_millis(Utc::now()))
        .fetch_optional(pool)
        .await
        .map_err(|e| map_constraint(e, "runs"))?;

        row.map(Run::try_from).transpose()
    }

    /// Create a run of the given kind guarded only by the one-active-instance
    /// index, so an instance whose earlier run is terminal can run again.
    pub async fn insert(pool: &SqlitePool, run: &NewRun) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "INSERT INTO runs (task_name, logical_ts, window_start, state, trigger_kind, created_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?5)
             ON CONFLICT DO NOTHING
             RETURNING *",
        )
        .bind(&run.task_name)
        .bind(to_millis(run.logical_ts))
        .bind(to_millis(run.window_start))
        .bind(run.trigger_kind.as_str())
        .bind(to_millis(Utc::now()))
        .fetch_optional(pool)
        .await
        .map_err(|e| map_constraint(e, "runs"))?;

        row.map(Run::try_from).transpose()
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.map(Run::try_from).transpose()
    }

    /// Latest logical timestamp for which a scheduled run was ever created.
    pub async fn latest_scheduled_ts(
        pool: &SqlitePool,
        task: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let ms: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(logical_ts) FROM runs WHERE task_name = ?1 AND trigger_kind = 'scheduled'",
        )
        .bind(task)
        .fetch_one(pool)
        .await?;
        opt_from_millis(ms)
    }

    /// The task's most recent run with logical timestamp `<= ts`.
    ///
    /// Used for dependency matching, so tasks with different cadences line up
    /// on the latest upstream instance that covers the downstream one.
    pub async fn latest_at_or_before(
        pool: &SqlitePool,
        task: &str,
        ts: DateTime<Utc>,
    ) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs
             WHERE task_name = ?1 AND logical_ts <= ?2
             ORDER BY logical_ts DESC, id DESC
             LIMIT 1",
        )
        .bind(task)
        .bind(to_millis(ts))
        .fetch_optional(pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    /// All runs in `state`, oldest logical timestamp first.
    pub async fn in_state(pool: &SqlitePool, state: RunState) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE state = ?1 ORDER BY logical_ts, id",
        )
        .bind(state.as_str())
        .fetch_all(pool)
        .await?;
        decode_all(rows)
    }

    /// Retrying runs whose backoff has elapsed.
    pub async fn due_retries(
        pool: &SqlitePool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs
             WHERE state = 'retrying' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY logical_ts, id",
        )
        .bind(to_millis(now))
        .fetch_all(pool)
        .await?;
        decode_all(rows)
    }

    pub async fn count_running(pool: &SqlitePool, task: &str) -> Result<u32, StoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM runs WHERE task_name = ?1 AND state = 'running'",
        )
        .bind(task)
        .fetch_one(pool)
        .await?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Run history, newest logical timestamp first.
    pub async fn history(pool: &SqlitePool, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs
             WHERE (?1 IS NULL OR task_name = ?1)
               AND (?2 IS NULL OR logical_ts >= ?2)
               AND (?3 IS NULL OR logical_ts <= ?3)
               AND (?4 IS NULL OR state = ?4)
             ORDER BY logical_ts DESC, id DESC
             LIMIT ?5",
        )
        .bind(filter.task.as_deref())
        .bind(filter.from.map(to_millis))
        .bind(filter.to.map(to_millis))
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.limit.map(i64::from).unwrap_or(-1))
        .fetch_all(pool)
        .await?;
        decode_all(rows)
    }

    /// Compare-and-set transition. Returns the updated run, or `None` when
    /// the run was not in `from` any more.
    pub async fn transition(
        pool: &SqlitePool,
        id: i64,
        from: RunState,
        to: RunState,
        update: RunUpdate,
    ) -> Result<Option<Run>, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let summary = update
            .summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Decode(format!("run {id} summary: {e}")))?;

        let row = sqlx::query_as::<_, RunRow>(
            "UPDATE runs SET
                state = ?1,
                attempt = attempt + ?2,
                started_at = COALESCE(?3, started_at),
                ended_at = ?4,
                error = COALESCE(?5, error),
                summary = COALESCE(?6, summary),
                next_attempt_at = ?7
             WHERE id = ?8 AND state = ?9
             RETURNING *",
        )
        .bind(to.as_str())
        .bind(i64::from(update.bump_attempt))
        .bind(update.started_at.map(to_millis))
        .bind(update.ended_at.map(to_millis))
        .bind(update.error)
        .bind(summary)
        .bind(update.next_attempt_at.map(to_millis))
        .bind(id)
        .bind(from.as_str())
        .fetch_optional(pool)
        .await
        .map_err(|e| map_constraint(e, "runs"))?;

        row.map(Run::try_from).transpose()
    }

    /// `queued -> running`, counting a new attempt.
    pub async fn start(
        pool: &SqlitePool,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>, StoreError> {
        let update = RunUpdate {
            bump_attempt: true,
            started_at: Some(now),
            ..Default::default()
        };
        Self::transition(pool, id, RunState::Queued, RunState::Running, update).await
    }

    pub async fn succeed(
        pool: &SqlitePool,
        id: i64,
        now: DateTime<Utc>,
        summary: serde_json::Value,
    ) -> Result<Option<Run>, StoreError> {
        let update = RunUpdate {
            ended_at: Some(now),
            summary: Some(summary),
            ..Default::default()
        };
        Self::transition(pool, id, RunState::Running, RunState::Success, update).await
    }

    pub async fn retry(
        pool: &SqlitePool,
        id: i64,
        now: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Option<Run>, StoreError> {
        let update = RunUpdate {
            ended_at: Some(now),
            error: Some(error.to_string()),
            next_attempt_at: Some(next_attempt_at),
            ..Default::default()
        };
        Self::transition(pool, id, RunState::Running, RunState::Retrying, update).await
    }

    pub async fn fail(
        pool: &SqlitePool,
        id: i64,
        from: RunState,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<Option<Run>, StoreError> {
        let update = RunUpdate {
            ended_at: Some(now),
            error: Some(error.to_string()),
            ..Default::default()
        };
        Self::transition(pool, id, from, RunState::Failed, update).await
    }

    pub async fn skip(
        pool: &SqlitePool,
        id: i64,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<Run>, StoreError> {
        let update = RunUpdate {
            ended_at: Some(now),
            error: Some(reason.to_string()),
            ..Default::default()
        };
        Self::transition(pool, id, RunState::Queued, RunState::Skipped, update).await
    }

    /// `retrying -> queued` once the backoff has elapsed.
    pub async fn requeue(pool: &SqlitePool, id: i64) -> Result<Option<Run>, StoreError> {
        Self::transition(pool, id, RunState::Retrying, RunState::Queued, RunUpdate::default())
            .await
    }

    /// Flag a non-terminal run for cancellation.
    ///
    /// Returns `Ok(None)` when the run exists but is already terminal.
    pub async fn request_cancel(pool: &SqlitePool, id: i64) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "UPDATE runs SET cancel_requested = 1
             WHERE id = ?1 AND state IN ('queued', 'running', 'retrying')
             RETURNING *",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Run::try_from(row)?)),
            None => match Self::get(pool, id).await? {
                Some(_) => Ok(None),
                None => Err(StoreError::NotFound(format!("run {id}"))),
            },
        }
    }

    pub async fn is_cancel_requested(pool: &SqlitePool, id: i64) -> Result<bool, StoreError> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM runs WHERE id = ?1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        flag.ok_or_else(|| StoreError::NotFound(format!("run {id}")))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::in_memory;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn new_run(task: &str, ts: DateTime<Utc>, kind: TriggerKind) -> NewRun {
        NewRun {
            task_name: task.to_string(),
            logical_ts: ts,
            window_start: ts - Duration::hours(1),
            trigger_kind: kind,
        }
    }

    #[test]
    fn state_machine_edges() {
        assert!(RunState::Queued.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Retrying));
        assert!(RunState::Retrying.can_transition_to(RunState::Queued));
        assert!(!RunState::Queued.can_transition_to(RunState::Success));
        for terminal in [RunState::Success, RunState::Failed, RunState::Skipped] {
            assert!(terminal.is_terminal());
            for next in RunState::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn state_parses_from_column_value() {
        for state in RunState::ALL {
            assert_eq!(state.as_str().parse::<RunState>().unwrap(), state);
        }
        assert!("done".parse::<RunState>().is_err());
    }

    #[tokio::test]
    async fn scheduled_insert_is_idempotent() {
        let pool = in_memory().await.unwrap();
        let req = new_run("harvest", t(1), TriggerKind::Scheduled);
        let first = RunStore::insert_scheduled(&pool, &req).await.unwrap().unwrap();
        assert_eq!(first.state, RunState::Queued);
        assert_eq!(first.attempt, 0);
        assert!(RunStore::insert_scheduled(&pool, &req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_scheduled_inserts_create_one_run() {
        let pool = in_memory().await.unwrap();
        let req = new_run("harvest", t(2), TriggerKind::Scheduled);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                let req = req.clone();
                tokio::spawn(async move { RunStore::insert_scheduled(&pool, &req).await })
            })
            .collect();
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        let all = RunStore::history(&pool, &RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn manual_rerun_allowed_only_after_terminal() {
        let pool = in_memory().await.unwrap();
        let sched = new_run("harvest", t(3), TriggerKind::Scheduled);
        let run = RunStore::insert_scheduled(&pool, &sched).await.unwrap().unwrap();

        let manual = new_run("harvest", t(3), TriggerKind::Manual);
        assert!(RunStore::insert(&pool, &manual).await.unwrap().is_none());

        RunStore::start(&pool, run.id, t(3)).await.unwrap().unwrap();
        RunStore::succeed(&pool, run.id, t(3), json!({"published": 2}))
            .await
            .unwrap()
            .unwrap();

        let rerun = RunStore::insert(&pool, &manual).await.unwrap().unwrap();
        assert_eq!(rerun.trigger_kind, TriggerKind::Manual);
        // The scheduler still never re-creates a finished instance.
        assert!(RunStore::insert_scheduled(&pool, &sched).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_runs_are_immutable() {
        let pool = in_memory().await.unwrap();
        let run = RunStore::insert_scheduled(&pool, &new_run("a", t(4), TriggerKind::Scheduled))
            .await
            .unwrap()
            .unwrap();
        let running = RunStore::start(&pool, run.id, t(4)).await.unwrap().unwrap();
        assert_eq!(running.attempt, 1);
        assert_eq!(running.started_at, Some(t(4)));

        RunStore::fail(&pool, run.id, RunState::Running, t(5), "boom")
            .await
            .unwrap()
            .unwrap();
        // CAS misses: the run is no longer running.
        assert!(RunStore::succeed(&pool, run.id, t(5), json!({})).await.unwrap().is_none());
        let stored = RunStore::get(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected_before_sql() {
        let pool = in_memory().await.unwrap();
        let err = RunStore::transition(&pool, 1, RunState::Success, RunState::Running, RunUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn retry_cycle_records_backoff() {
        let pool = in_memory().await.unwrap();
        let run = RunStore::insert_scheduled(&pool, &new_run("a", t(6), TriggerKind::Scheduled))
            .await
            .unwrap()
            .unwrap();
        RunStore::start(&pool, run.id, t(6)).await.unwrap();
        let retrying = RunStore::retry(&pool, run.id, t(6), t(7), "timeout")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retrying.next_attempt_at, Some(t(7)));

        assert!(RunStore::due_retries(&pool, t(6)).await.unwrap().is_empty());
        assert_eq!(RunStore::due_retries(&pool, t(7)).await.unwrap().len(), 1);

        let queued = RunStore::requeue(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(queued.next_attempt_at, None);
        let second = RunStore::start(&pool, run.id, t(7)).await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.ended_at, None);
    }

    #[tokio::test]
    async fn history_filters_by_task_and_range() {
        let pool = in_memory().await.unwrap();
        for hour in 1..=4 {
            RunStore::insert_scheduled(&pool, &new_run("a", t(hour), TriggerKind::Scheduled))
                .await
                .unwrap();
        }
        RunStore::insert_scheduled(&pool, &new_run("b", t(2), TriggerKind::Scheduled))
            .await
            .unwrap();

        let filter = RunFilter {
            task: Some("a".into()),
            from: Some(t(2)),
            to: Some(t(3)),
            ..Default::default()
        };
        let runs = RunStore::history(&pool, &filter).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.logical_ts).collect::<Vec<_>>(), vec![t(3), t(2)]);

        let limited = RunFilter { limit: Some(2), ..Default::default() };
        assert_eq!(RunStore::history(&pool, &limited).await.unwrap().len(), 2);
        assert_eq!(RunStore::latest_scheduled_ts(&pool, "a").await.unwrap(), Some(t(4)));
        assert_eq!(RunStore::latest_scheduled_ts(&pool, "zzz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn latest_at_or_before_matches_covering_run() {
        let pool = in_memory().await.unwrap();
        for hour in [1, 3] {
            RunStore::insert_scheduled(&pool, &new_run("up", t(hour), TriggerKind::Scheduled))
                .await
                .unwrap();
        }
        let hit = RunStore::latest_at_or_before(&pool, "up", t(2)).await.unwrap().unwrap();
        assert_eq!(hit.logical_ts, t(1));
        assert!(RunStore::latest_at_or_before(&pool, "up", t(0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_flag_only_on_active_runs() {
        let pool = in_memory().await.unwrap();
        let run = RunStore::insert_scheduled(&pool, &new_run("a", t(8), TriggerKind::Scheduled))
            .await
            .unwrap()
            .unwrap();
        assert!(!RunStore::is_cancel_requested(&pool, run.id).await.unwrap());
        let flagged = RunStore::request_cancel(&pool, run.id).await.unwrap().unwrap();
        assert!(flagged.cancel_requested);

        RunStore::fail(&pool, run.id, RunState::Queued, t(8), "cancelled").await.unwrap();
        assert!(RunStore::request_cancel(&pool, run.id).await.unwrap().is_none());
        assert!(matches!(
            RunStore::request_cancel(&pool, 999).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }
}
