//! Task listing and operator controls.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use siphon_scheduler::TaskStatus;
use siphon_storage::Run;

use super::{scheduler_error, ApiError};
use crate::app::App;

#[derive(Debug, Default, Deserialize)]
pub struct TriggerQuery {
    /// Logical timestamp of the manual run; defaults to now.
    pub at: Option<DateTime<Utc>>,
}

/// GET /tasks
pub async fn list_tasks(State(app): State<Arc<App>>) -> Result<Json<Vec<TaskStatus>>, ApiError> {
    let tasks = app.scheduler.task_statuses().await.map_err(scheduler_error)?;
    Ok(Json(tasks))
}

/// POST /tasks/{name}/trigger?at=
pub async fn trigger_task(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Query(query): Query<TriggerQuery>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let run = app
        .scheduler
        .trigger(&name, query.at)
        .await
        .map_err(scheduler_error)?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// POST /tasks/{name}/pause
pub async fn pause_task(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    app.scheduler.pause(&name).await.map_err(scheduler_error)?;
    Ok(Json(json!({ "task": name, "paused": true })))
}

/// POST /tasks/{name}/resume
pub async fn resume_task(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    app.scheduler.resume(&name).await.map_err(scheduler_error)?;
    Ok(Json(json!({ "task": name, "paused": false })))
}
