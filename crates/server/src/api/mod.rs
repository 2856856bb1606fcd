//! Admin API handlers.
//!
//! Each sub-module owns one resource; shared error mapping lives here.

mod health;
mod records;
mod runs;
mod tasks;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use siphon_queue::BrokerError;
use siphon_scheduler::SchedulerError;
use siphon_storage::StoreError;

// ── Shared error type ────────────────────────────────────────────

/// Error body: `{"error": "..."}` with the status the domain error maps to.
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: u16, message: impl std::fmt::Display) -> ApiError {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": message.to_string() })))
}

pub(crate) fn scheduler_error(e: SchedulerError) -> ApiError {
    api_error(e.status_code(), e)
}

pub(crate) fn store_error(e: StoreError) -> ApiError {
    api_error(e.status_code(), e)
}

pub(crate) fn broker_error(e: BrokerError) -> ApiError {
    api_error(503, e)
}

// ── Re-exports ───────────────────────────────────────────────────

pub use health::{health, metrics};
pub use records::{get_record, list_records};
pub use runs::{cancel_run, get_run, list_runs};
pub use tasks::{list_tasks, pause_task, resume_task, trigger_task};
