use axum::http::StatusCode;

use crate::helpers::*;

#[tokio::test]
async fn test_health_reports_fresh_scheduler() {
    let h = harness(vec![]).await;
    let (status, body) = send(router(&h), "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["scheduler"]["healthy"], true);
}

#[tokio::test]
async fn test_trigger_then_list_runs() {
    let h = harness(vec![item("a", "first")]).await;

    let uri = format!("/tasks/{TASK}/trigger?at=2024-05-01T03:00:00Z");
    let (status, run) = send(router(&h), "POST", &uri).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(run["task_name"], TASK);
    assert_eq!(run["state"], "queued");
    assert_eq!(run["trigger_kind"], "manual");

    // Same instance while still queued.
    let (status, body) = send(router(&h), "POST", &uri).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    let (status, runs) = send(router(&h), "GET", &format!("/runs?task={TASK}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs.as_array().unwrap().len(), 1);

    let id = run["id"].as_i64().unwrap();
    let (status, fetched) = send(router(&h), "GET", &format!("/runs/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id);
}

#[tokio::test]
async fn test_unknown_task_is_404() {
    let h = harness(vec![]).await;
    let (status, _) = send(router(&h), "POST", "/tasks/compact/trigger").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(router(&h), "POST", "/tasks/compact/pause").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pause_and_resume_show_in_task_list() {
    let h = harness(vec![]).await;

    let (status, body) = send(router(&h), "POST", &format!("/tasks/{TASK}/pause")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], true);

    let (_, tasks) = send(router(&h), "GET", "/tasks").await;
    assert_eq!(tasks[0]["name"], TASK);
    assert_eq!(tasks[0]["paused"], true);

    send(router(&h), "POST", &format!("/tasks/{TASK}/resume")).await;
    let (_, tasks) = send(router(&h), "GET", "/tasks").await;
    assert_eq!(tasks[0]["paused"], false);
}

#[tokio::test]
async fn test_records_are_browsable_after_ingest() {
    let h = harness(vec![item("a", "first"), item("b", "second")]).await;
    h.app.scheduler.run_pending(t(0)).await.unwrap();
    consume_all(&h.app).await;

    let (status, page) = send(router(&h), "GET", "/records?source=rust&limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 2);
    assert_eq!(page["records"].as_array().unwrap().len(), 1);

    let (status, record) = send(router(&h), "GET", "/records/rust:b").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["payload"]["title"], "second");

    let (status, _) = send(router(&h), "GET", "/records/rust:zzz").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, metrics) = send(router(&h), "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["records"], 2);
    assert_eq!(metrics["consumer"]["lag"], 0);
    assert_eq!(metrics["consumer"]["committed"], 2);
}

#[tokio::test]
async fn test_cancel_queued_run() {
    let h = harness(vec![]).await;
    let run = h.app.scheduler.trigger(TASK, Some(t(5))).await.unwrap();

    let (status, body) = send(router(&h), "POST", &format!("/runs/{}/cancel", run.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["state"], "queued");

    let (status, _) = send(router(&h), "POST", "/runs/9999/cancel").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
