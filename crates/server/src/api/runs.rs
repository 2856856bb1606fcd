use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;

use siphon_storage::{Run, RunFilter, RunStore};

use super::{api_error, scheduler_error, store_error, ApiError};
use crate::app::App;

/// GET /runs?task=&from=&to=&state=&limit= — run history, newest first.
pub async fn list_runs(
    State(app): State<Arc<App>>,
    Query(filter): Query<RunFilter>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let runs = app.scheduler.run_history(&filter).await.map_err(scheduler_error)?;
    Ok(Json(runs))
}

/// GET /runs/{id}
pub async fn get_run(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
) -> Result<Json<Run>, ApiError> {
    RunStore::get(&app.pool, id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| api_error(404, format!("run {id} not found")))
}

/// POST /runs/{id}/cancel
pub async fn cancel_run(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
) -> Result<Json<Run>, ApiError> {
    let run = app.scheduler.cancel(id).await.map_err(scheduler_error)?;
    Ok(Json(run))
}
