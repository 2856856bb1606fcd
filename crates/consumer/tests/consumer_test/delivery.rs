use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use siphon_consumer::ConsumerWorker;
use siphon_core::config::StoreConfig;
use siphon_core::Record;
use siphon_queue::{Broker, MemoryBroker, SqlBroker};
use siphon_storage::{OffsetStore, RecordStore};

use crate::helpers::{fast_config, publish, spawn, wait_for_no_lag, GROUP, TOPIC};

#[tokio::test]
async fn test_redelivery_keeps_one_row_per_key() {
    let broker = Arc::new(MemoryBroker::new(3));
    let pool = siphon_storage::in_memory().await.unwrap();

    publish(broker.as_ref(), "rust:a", json!({ "title": "first" })).await;
    publish(broker.as_ref(), "rust:b", json!({ "title": "b" })).await;
    let running = spawn(broker.clone(), pool.clone(), fast_config());
    wait_for_no_lag(broker.as_ref()).await;
    running.stop().await.unwrap();

    // A producer re-run publishes the same keys again, one with a new payload.
    publish(broker.as_ref(), "rust:a", json!({ "title": "second" })).await;
    publish(broker.as_ref(), "rust:b", json!({ "title": "b" })).await;
    let running = spawn(broker.clone(), pool.clone(), fast_config());
    wait_for_no_lag(broker.as_ref()).await;
    let stats = running.stop().await.unwrap();

    assert_eq!(stats.messages, 2, "restarted worker reads only new messages");
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(RecordStore::count(&pool).await.unwrap(), 2);

    let a = RecordStore::get(&pool, "rust:a").await.unwrap().unwrap();
    assert_eq!(a.payload["title"], "second");
    assert_eq!(a.version, 2);
    let b = RecordStore::get(&pool, "rust:b").await.unwrap().unwrap();
    assert_eq!(b.version, 1);

    assert_eq!(OffsetStore::total(&pool, GROUP, TOPIC).await.unwrap(), 4);
}

#[tokio::test]
async fn test_durable_topic_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        database_url: format!("sqlite://{}", dir.path().join("state.db").display()),
        max_connections: 4,
    };

    {
        let pool = siphon_storage::connect(&config).await.unwrap();
        let broker = Arc::new(SqlBroker::new(pool.clone(), 2).await.unwrap());
        for i in 0..3 {
            publish(broker.as_ref(), &format!("rust:{i}"), json!({ "n": i })).await;
        }
        let running = spawn(broker.clone(), pool.clone(), fast_config());
        wait_for_no_lag(broker.as_ref()).await;
        running.stop().await.unwrap();
        pool.close().await;
    }

    let pool = siphon_storage::connect(&config).await.unwrap();
    let broker = Arc::new(SqlBroker::new(pool.clone(), 2).await.unwrap());
    assert_eq!(broker.lag(GROUP, TOPIC).await.unwrap(), 0);
    publish(broker.as_ref(), "rust:3", json!({ "n": 3 })).await;

    let running = spawn(broker.clone(), pool.clone(), fast_config());
    wait_for_no_lag(broker.as_ref()).await;
    let stats = running.stop().await.unwrap();

    assert_eq!(stats.messages, 1);
    assert_eq!(RecordStore::count(&pool).await.unwrap(), 4);
    assert_eq!(OffsetStore::total(&pool, GROUP, TOPIC).await.unwrap(), 4);
}

#[tokio::test]
async fn test_crash_before_commit_reprocesses_without_duplicates() {
    let broker = Arc::new(MemoryBroker::new(2));
    let pool = siphon_storage::in_memory().await.unwrap();
    for key in ["rust:a", "rust:b", "rust:c"] {
        publish(broker.as_ref(), key, json!({ "title": key })).await;
    }

    // First process: polls the batch and writes its rows, then dies before
    // recording offsets or committing to the broker.
    {
        let worker = ConsumerWorker::new(broker.clone(), pool.clone(), fast_config());
        worker.start().await.unwrap();
        let polled = broker
            .poll(GROUP, TOPIC, 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(polled.len(), 3);
        let records: Vec<Record> = polled
            .iter()
            .map(|m| Record::from_bytes(&m.payload).unwrap())
            .collect();
        RecordStore::upsert_batch(&pool, &records).await.unwrap();
    }
    assert_eq!(RecordStore::count(&pool).await.unwrap(), 3);
    assert_eq!(broker.lag(GROUP, TOPIC).await.unwrap(), 3);
    assert_eq!(OffsetStore::total(&pool, GROUP, TOPIC).await.unwrap(), 0);

    // Restart with a fresh worker on the same broker and store.
    let running = spawn(broker.clone(), pool.clone(), fast_config());
    wait_for_no_lag(broker.as_ref()).await;
    let stats = running.stop().await.unwrap();

    assert_eq!(stats.messages, 3, "uncommitted batch is redelivered");
    assert_eq!(stats.inserted, 0);
    assert_eq!(stats.unchanged, 3);
    assert_eq!(RecordStore::count(&pool).await.unwrap(), 3);
    for key in ["rust:a", "rust:b", "rust:c"] {
        let stored = RecordStore::get(&pool, key).await.unwrap().unwrap();
        assert_eq!(stored.version, 1, "{key} was not rewritten");
    }
    assert_eq!(OffsetStore::total(&pool, GROUP, TOPIC).await.unwrap(), 3);
    assert_eq!(broker.lag(GROUP, TOPIC).await.unwrap(), 0);
}
