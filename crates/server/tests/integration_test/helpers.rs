use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use siphon_core::Config;
use siphon_ingest::StaticSource;
use siphon_queue::MemoryBroker;
use siphon_scheduler::PipelineFile;
use siphon_server::App;

pub const COLLECTION: &str = "rust";
pub const TASK: &str = "harvest-rust";

const PIPELINE: &str = r#"
[[task]]
name = "harvest-rust"
action = "produce"
collection = "rust"
interval_secs = 3600
start_date = "2024-05-01T00:00:00Z"
"#;

pub fn t(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
}

pub fn item(id: &str, title: &str) -> Value {
    json!({ "id": id, "title": title })
}

/// An app over an in-memory store and broker, fed by a static source.
pub struct Harness {
    pub app: Arc<App>,
    pub source: Arc<StaticSource>,
}

pub async fn harness(items: Vec<Value>) -> Harness {
    let source = Arc::new(StaticSource::new().with_items(COLLECTION, items));
    let pool = siphon_storage::in_memory().await.unwrap();
    let app = App::assemble(
        Config::for_profile(""),
        pool,
        Arc::new(MemoryBroker::new(3)),
        source.clone(),
        PipelineFile::parse(PIPELINE).unwrap(),
    )
    .unwrap();
    Harness {
        app: Arc::new(app),
        source,
    }
}

/// Persist everything currently on the topic with the app's consumer.
pub async fn consume_all(app: &App) -> u64 {
    let worker = app.consumer();
    worker.start().await.unwrap();
    let group = &app.config.consumer.group_id;
    let topic = &app.config.broker.topic;

    let mut processed = 0;
    loop {
        let messages = app
            .broker
            .poll(group, topic, 100, Duration::from_millis(20))
            .await
            .unwrap();
        if messages.is_empty() {
            return processed;
        }
        let outcome = worker.process_batch(&messages).await.unwrap();
        processed += outcome.messages as u64;
    }
}

pub fn router(harness: &Harness) -> Router {
    siphon_server::build_router(harness.app.clone())
}

pub async fn send(router: Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}
