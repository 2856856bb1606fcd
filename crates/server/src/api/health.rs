//! Liveness and metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use siphon_queue::Broker;
use siphon_scheduler::{Liveness, SchedulerMetrics};
use siphon_storage::{OffsetStore, RecordStore};

use super::{broker_error, store_error, ApiError};
use crate::app::App;

// ── Health ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub scheduler: Liveness,
}

/// 200 while the scheduler ticks on time, 503 once the last tick is stale.
pub async fn health(State(app): State<Arc<App>>) -> (StatusCode, Json<HealthResponse>) {
    let liveness = app.scheduler.liveness();
    let (code, status) = if liveness.healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stale")
    };
    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            scheduler: liveness,
        }),
    )
}

// ── Metrics ───────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ConsumerMetrics {
    pub group: String,
    pub topic: String,
    /// Messages on the topic the group has not committed past.
    pub lag: u64,
    /// Sum of the group's stored offsets across partitions.
    pub committed: i64,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub scheduler: SchedulerMetrics,
    pub consumer: ConsumerMetrics,
    pub records: u64,
}

pub async fn metrics(State(app): State<Arc<App>>) -> Result<Json<MetricsResponse>, ApiError> {
    let group = app.config.consumer.group_id.clone();
    let topic = app.config.broker.topic.clone();

    let lag = app.broker.lag(&group, &topic).await.map_err(broker_error)?;
    let committed = OffsetStore::total(&app.pool, &group, &topic)
        .await
        .map_err(store_error)?;
    let records = RecordStore::count(&app.pool).await.map_err(store_error)?;

    Ok(Json(MetricsResponse {
        scheduler: app.scheduler.metrics(),
        consumer: ConsumerMetrics {
            group,
            topic,
            lag,
            committed,
        },
        records,
    }))
}
