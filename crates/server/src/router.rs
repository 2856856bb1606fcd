//! Admin HTTP router construction.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api;
use crate::app::App;

/// Build the admin router with CORS applied.
pub fn build_router(app: Arc<App>) -> Router {
    let cors = cors_layer(&app.config.admin.cors_origin);
    Router::new()
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .route("/tasks", get(api::list_tasks))
        .route("/tasks/{name}/trigger", post(api::trigger_task))
        .route("/tasks/{name}/pause", post(api::pause_task))
        .route("/tasks/{name}/resume", post(api::resume_task))
        .route("/runs", get(api::list_runs))
        .route("/runs/{id}", get(api::get_run))
        .route("/runs/{id}/cancel", post(api::cancel_run))
        .route("/records", get(api::list_records))
        .route("/records/{key}", get(api::get_record))
        .layer(cors)
        .with_state(app)
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::permissive();
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            warn!(origin, error = %e, "invalid CORS_ORIGIN; cross-origin requests disabled");
            CorsLayer::new()
        }
    }
}
