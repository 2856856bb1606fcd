use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use siphon_consumer::{ConsumerConfig, ConsumerError, ConsumerWorker, WorkerStats};
use siphon_core::Record;
use siphon_queue::Broker;
use siphon_storage::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "records";
pub const GROUP: &str = "sink";

/// Worker config with short polls and backoff so tests stay fast.
pub fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        poll_timeout_ms: 20,
        backoff_base_ms: 10,
        backoff_cap_ms: 40,
        ..ConsumerConfig::new(GROUP, TOPIC)
    }
}

pub async fn publish(broker: &dyn Broker, key: &str, payload: Value) {
    let record = Record::new(key, "rust", payload, Utc::now()).unwrap();
    broker
        .publish(TOPIC, key, &record.to_bytes().unwrap())
        .await
        .unwrap();
}

/// A worker running in the background until its token is cancelled.
pub struct Running {
    pub shutdown: CancellationToken,
    handle: JoinHandle<Result<WorkerStats, ConsumerError>>,
}

impl Running {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn stop(self) -> Result<WorkerStats, ConsumerError> {
        self.shutdown.cancel();
        self.handle.await.unwrap()
    }
}

pub fn spawn(broker: Arc<dyn Broker>, pool: SqlitePool, config: ConsumerConfig) -> Running {
    let shutdown = CancellationToken::new();
    let worker = ConsumerWorker::new(broker, pool, config);
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });
    Running { shutdown, handle }
}

/// Wait until the group has consumed everything on the topic.
pub async fn wait_for_no_lag(broker: &dyn Broker) {
    for _ in 0..300 {
        if broker.lag(GROUP, TOPIC).await.unwrap() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("consumer lag did not drain");
}
