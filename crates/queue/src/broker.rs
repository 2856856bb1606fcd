//! Broker client trait and message types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::BrokerError;

/// Acknowledgement for a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
}

/// A message read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: String,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

/// Publish/subscribe primitives with consumer-group cursors.
///
/// Offsets are per partition and start at 0. A committed offset is the next
/// offset the group will read, so committing `n + 1` marks everything up to
/// and including `n` as processed. Commits never move a cursor backwards.
///
/// `commit` is the delivery-guarantee boundary: callers only commit offsets
/// whose records are already durable downstream.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message, routed to a partition by `key`. Returns once the
    /// broker has durably accepted it.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Ack, BrokerError>;

    /// Start a consumer session for `group`: fetch positions are reset to the
    /// group's committed offsets (earliest for a new group).
    async fn subscribe(&self, group: &str, topic: &str) -> Result<(), BrokerError>;

    /// Fetch up to `max_batch` messages past the session's fetch positions.
    ///
    /// Waits up to `timeout` for data; returns an empty vec when none arrives.
    async fn poll(
        &self,
        group: &str,
        topic: &str,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError>;

    /// Commit `offset` as the next offset to read for the partition.
    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), BrokerError>;

    /// The group's committed offset for a partition, if any.
    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<i64>, BrokerError>;

    /// Number of messages in the topic past the group's committed offsets.
    async fn lag(&self, group: &str, topic: &str) -> Result<u64, BrokerError>;

    /// Partition count used for `topic`.
    fn partitions(&self, topic: &str) -> u32;
}

/// Blanket implementation so `Arc<dyn Broker>` can be used directly.
#[async_trait]
impl<T: Broker + ?Sized> Broker for Arc<T> {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Ack, BrokerError> {
        (**self).publish(topic, key, payload).await
    }

    async fn subscribe(&self, group: &str, topic: &str) -> Result<(), BrokerError> {
        (**self).subscribe(group, topic).await
    }

    async fn poll(
        &self,
        group: &str,
        topic: &str,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        (**self).poll(group, topic, max_batch, timeout).await
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), BrokerError> {
        (**self).commit(group, topic, partition, offset).await
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<i64>, BrokerError> {
        (**self).committed(group, topic, partition).await
    }

    async fn lag(&self, group: &str, topic: &str) -> Result<u64, BrokerError> {
        (**self).lag(group, topic).await
    }

    fn partitions(&self, topic: &str) -> u32 {
        (**self).partitions(topic)
    }
}
