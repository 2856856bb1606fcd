//! Read-only access to ingested records.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use siphon_storage::{RecordStore, StoredRecord};

use super::{api_error, store_error, ApiError};
use crate::app::App;

const MAX_PAGE: u32 = 500;

#[derive(Debug, Deserialize)]
pub struct RecordQuery {
    pub source: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

#[derive(Serialize)]
pub struct RecordPage {
    pub total: u64,
    pub records: Vec<StoredRecord>,
}

/// GET /records?source=&limit=&offset=
pub async fn list_records(
    State(app): State<Arc<App>>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<RecordPage>, ApiError> {
    let limit = query.limit.clamp(1, MAX_PAGE);
    let records = RecordStore::list(&app.pool, query.source.as_deref(), limit, query.offset)
        .await
        .map_err(store_error)?;
    let total = RecordStore::count(&app.pool).await.map_err(store_error)?;
    Ok(Json(RecordPage { total, records }))
}

/// GET /records/{key}
pub async fn get_record(
    State(app): State<Arc<App>>,
    Path(key): Path<String>,
) -> Result<Json<StoredRecord>, ApiError> {
    RecordStore::get(&app.pool, &key)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| api_error(404, format!("record '{key}' not found")))
}
