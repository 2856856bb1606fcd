use siphon_storage::{OffsetStore, RecordStore, RunFilter, RunState};

use crate::helpers::*;

#[tokio::test]
async fn test_harvest_rerun_at_same_logical_ts_updates_in_place() {
    let h = harness(vec![item("a", "first"), item("b", "second")]).await;
    let scheduler = &h.app.scheduler;
    let pool = &h.app.pool;
    let group = &h.app.config.consumer.group_id;
    let topic = &h.app.config.broker.topic;

    let report = scheduler.run_pending(t(0)).await.unwrap();
    assert_eq!(report.created.len(), 1);
    assert_eq!(consume_all(&h.app).await, 2);
    assert_eq!(RecordStore::count(pool).await.unwrap(), 2);
    assert_eq!(OffsetStore::total(pool, group, topic).await.unwrap(), 2);

    // Same logical timestamp again: one item changed, one untouched.
    h.source
        .set_items(COLLECTION, vec![item("a", "first, edited"), item("b", "second")]);
    let rerun = scheduler.trigger(TASK, Some(t(0))).await.unwrap();
    assert_eq!(rerun.logical_ts, t(0));
    scheduler.run_pending(t(0)).await.unwrap();
    assert_eq!(consume_all(&h.app).await, 2);

    assert_eq!(RecordStore::count(pool).await.unwrap(), 2);
    let a = RecordStore::get(pool, "rust:a").await.unwrap().unwrap();
    assert_eq!(a.payload["title"], "first, edited");
    assert_eq!(a.version, 2);
    let b = RecordStore::get(pool, "rust:b").await.unwrap().unwrap();
    assert_eq!(b.payload["title"], "second");
    assert_eq!(b.version, 1);
    assert_eq!(OffsetStore::total(pool, group, topic).await.unwrap(), 4);

    let runs = scheduler
        .run_history(&RunFilter {
            task: Some(TASK.into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.state == RunState::Success && r.logical_ts == t(0)));
}

#[tokio::test]
async fn test_next_hour_gets_its_own_run() {
    let h = harness(vec![item("a", "first")]).await;
    let scheduler = &h.app.scheduler;

    scheduler.run_pending(t(0)).await.unwrap();
    let report = scheduler.run_pending(t(1)).await.unwrap();
    assert_eq!(report.created.len(), 1);
    assert_eq!(report.created[0].logical_ts, t(1));
    assert_eq!(report.created[0].window_start, t(0));

    // Unchanged item republished each hour still maps to one row.
    assert_eq!(consume_all(&h.app).await, 2);
    let a = RecordStore::get(&h.app.pool, "rust:a").await.unwrap().unwrap();
    assert_eq!(a.version, 1);
    assert_eq!(RecordStore::count(&h.app.pool).await.unwrap(), 1);
}

#[tokio::test]
async fn test_paused_task_creates_no_runs() {
    let h = harness(vec![item("a", "first")]).await;
    let scheduler = &h.app.scheduler;

    scheduler.pause(TASK).await.unwrap();
    let report = scheduler.run_pending(t(2)).await.unwrap();
    assert!(report.created.is_empty());
    assert_eq!(report.paused, vec![TASK.to_string()]);
    assert_eq!(consume_all(&h.app).await, 0);

    scheduler.resume(TASK).await.unwrap();
    let report = scheduler.run_pending(t(2)).await.unwrap();
    assert_eq!(report.created.len(), 3);
    assert_eq!(RecordStore::count(&h.app.pool).await.unwrap(), 0);
    consume_all(&h.app).await;
    assert_eq!(RecordStore::count(&h.app.pool).await.unwrap(), 1);
}
