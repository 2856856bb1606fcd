//! In-process partitioned log broker.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, instrument};

use crate::broker::{Ack, Broker, BrokerMessage};
use crate::error::BrokerError;
use crate::partition::partition_for;

type PartitionKey = (String, u32);

#[derive(Default)]
struct GroupCursor {
    committed: HashMap<PartitionKey, i64>,
    position: HashMap<PartitionKey, i64>,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<BrokerMessage>>>,
    groups: HashMap<String, GroupCursor>,
}

/// Partitioned append-only log kept in memory.
///
/// Topics are created on first use with the broker's partition count. Each
/// consumer group has committed offsets plus session fetch positions;
/// [`Broker::subscribe`] rewinds the fetch positions to the committed offsets,
/// which is what a restarted consumer sees.
pub struct MemoryBroker {
    partitions: u32,
    state: Mutex<LogState>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Mutex::new(LogState::default()),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        // The log is only mutated by complete pushes/inserts, so a poisoned
        // guard still holds consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total messages appended to `topic` across partitions.
    pub fn len(&self, topic: &str) -> usize {
        self.state()
            .topics
            .get(topic)
            .map(|parts| parts.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    fn take_available(
        &self,
        group: &str,
        topic: &str,
        max_batch: usize,
    ) -> Vec<BrokerMessage> {
        let mut state = self.state();
        let LogState { topics, groups } = &mut *state;
        let Some(parts) = topics.get(topic) else {
            return Vec::new();
        };
        let cursor = groups.entry(group.to_string()).or_default();

        let mut batch = Vec::new();
        for (partition, log) in parts.iter().enumerate() {
            if batch.len() >= max_batch {
                break;
            }
            let key = (topic.to_string(), partition as u32);
            let start = cursor
                .position
                .get(&key)
                .or_else(|| cursor.committed.get(&key))
                .copied()
                .unwrap_or(0)
                .max(0) as usize;
            let take = (max_batch - batch.len()).min(log.len().saturating_sub(start));
            if take == 0 {
                continue;
            }
            batch.extend_from_slice(&log[start..start + take]);
            cursor.position.insert(key, (start + take) as i64);
        }
        batch
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    #[instrument(skip_all, fields(topic = %topic, key = %key))]
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Ack, BrokerError> {
        let partition = partition_for(key, self.partitions);
        let offset = {
            let mut state = self.state();
            let parts = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
            let log = &mut parts[partition as usize];
            let offset = log.len() as i64;
            log.push(BrokerMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.to_string(),
                payload: payload.to_vec(),
                published_at: Utc::now(),
            });
            offset
        };
        self.notify.notify_waiters();
        debug!(partition, offset, "message appended");
        Ok(Ack {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn subscribe(&self, group: &str, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        let cursor = state.groups.entry(group.to_string()).or_default();
        cursor.position.retain(|(t, _), _| t != topic);
        debug!(group = %group, topic = %topic, "consumer session started");
        Ok(())
    }

    #[instrument(skip_all, fields(group = %group, topic = %topic))]
    async fn poll(
        &self,
        group: &str,
        topic: &str,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Registered before the check so a publish in between still wakes us.
            let notified = self.notify.notified();
            let batch = self.take_available(group, topic, max_batch);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), BrokerError> {
        if partition >= self.partitions {
            return Err(BrokerError::InvalidPartition {
                topic: topic.to_string(),
                partition,
            });
        }
        let mut state = self.state();
        let cursor = state.groups.entry(group.to_string()).or_default();
        let key = (topic.to_string(), partition);
        let committed = cursor.committed.entry(key.clone()).or_insert(offset);
        *committed = (*committed).max(offset);
        let committed = *committed;
        let position = cursor.position.entry(key).or_insert(committed);
        *position = (*position).max(committed);
        Ok(())
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<i64>, BrokerError> {
        let state = self.state();
        Ok(state
            .groups
            .get(group)
            .and_then(|c| c.committed.get(&(topic.to_string(), partition)))
            .copied())
    }

    async fn lag(&self, group: &str, topic: &str) -> Result<u64, BrokerError> {
        let state = self.state();
        let Some(parts) = state.topics.get(topic) else {
            return Ok(0);
        };
        let cursor = state.groups.get(group);
        let lag = parts
            .iter()
            .enumerate()
            .map(|(partition, log)| {
                let committed = cursor
                    .and_then(|c| c.committed.get(&(topic.to_string(), partition as u32)))
                    .copied()
                    .unwrap_or(0);
                (log.len() as i64 - committed).max(0) as u64
            })
            .sum();
        Ok(lag)
    }

    fn partitions(&self, _topic: &str) -> u32 {
        self.partitions
    }
}
