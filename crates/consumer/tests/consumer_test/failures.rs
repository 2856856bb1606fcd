use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use siphon_consumer::{ConsumerConfig, ConsumerError};
use siphon_queue::{Broker, MemoryBroker};
use siphon_storage::{OffsetStore, RecordStore};

use crate::helpers::{fast_config, publish, spawn, wait_for_no_lag, GROUP, TOPIC};

#[tokio::test]
async fn test_store_outage_is_retried_without_committing() {
    let broker = Arc::new(MemoryBroker::new(1));
    let pool = siphon_storage::in_memory().await.unwrap();

    sqlx::query(
        "CREATE TRIGGER records_offline BEFORE INSERT ON records
         BEGIN SELECT RAISE(ABORT, 'store offline'); END",
    )
    .execute(&pool)
    .await
    .unwrap();

    publish(broker.as_ref(), "rust:a", json!({ "title": "a" })).await;
    let running = spawn(broker.clone(), pool.clone(), fast_config());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(RecordStore::count(&pool).await.unwrap(), 0);
    assert_eq!(OffsetStore::total(&pool, GROUP, TOPIC).await.unwrap(), 0);
    assert_eq!(broker.lag(GROUP, TOPIC).await.unwrap(), 1);

    sqlx::query("DROP TRIGGER records_offline")
        .execute(&pool)
        .await
        .unwrap();
    wait_for_no_lag(broker.as_ref()).await;
    let stats = running.stop().await.unwrap();

    assert!(stats.failures >= 1);
    assert_eq!(stats.inserted, 1);
    assert_eq!(RecordStore::count(&pool).await.unwrap(), 1);
    assert_eq!(OffsetStore::total(&pool, GROUP, TOPIC).await.unwrap(), 1);
}

#[tokio::test]
async fn test_undecodable_message_halts_without_dead_letter() {
    let broker = Arc::new(MemoryBroker::new(1));
    let pool = siphon_storage::in_memory().await.unwrap();
    broker.publish(TOPIC, "rust:bad", b"\x00\x01").await.unwrap();

    let running = spawn(broker.clone(), pool.clone(), fast_config());
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if running.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "worker should stop on its own");

    let result = running.stop().await;
    assert!(matches!(result, Err(ConsumerError::Decode { offset: 0, .. })));
    assert_eq!(broker.lag(GROUP, TOPIC).await.unwrap(), 1);
}

#[tokio::test]
async fn test_undecodable_message_is_dead_lettered() {
    let broker = Arc::new(MemoryBroker::new(1));
    let pool = siphon_storage::in_memory().await.unwrap();
    broker.publish(TOPIC, "rust:bad", b"\x00\x01").await.unwrap();
    publish(broker.as_ref(), "rust:good", json!({ "title": "ok" })).await;

    let config = ConsumerConfig {
        dead_letter_after: Some(3),
        ..fast_config()
    };
    let running = spawn(broker.clone(), pool.clone(), config);
    wait_for_no_lag(broker.as_ref()).await;
    let stats = running.stop().await.unwrap();

    // Only the poison message is moved aside; its batch neighbour lands.
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(broker.len("records.dead-letter"), 1);
    assert!(RecordStore::get(&pool, "rust:good").await.unwrap().is_some());
    assert_eq!(OffsetStore::total(&pool, GROUP, TOPIC).await.unwrap(), 2);
}
