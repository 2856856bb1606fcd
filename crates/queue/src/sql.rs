//! Durable topic log stored in SQLite.
//!
//! Messages live in `broker_messages` keyed by (topic, partition, offset) and
//! committed group offsets in `broker_group_offsets`, so the topic survives
//! process restarts and acts as the durable retry queue for consumers. Session
//! fetch positions are kept in memory and reset by [`Broker::subscribe`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use crate::broker::{Ack, Broker, BrokerMessage};
use crate::error::BrokerError;
use crate::partition::partition_for;

/// How often an idle poll re-checks the log.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS broker_messages (
        topic TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        msg_offset INTEGER NOT NULL,
        msg_key TEXT NOT NULL,
        payload BLOB NOT NULL,
        published_at INTEGER NOT NULL,
        PRIMARY KEY (topic, partition_id, msg_offset)
    )",
    "CREATE TABLE IF NOT EXISTS broker_group_offsets (
        group_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        committed_offset INTEGER NOT NULL,
        PRIMARY KEY (group_id, topic, partition_id)
    )",
];

type SessionKey = (String, String, u32);

pub struct SqlBroker {
    pool: SqlitePool,
    partitions: u32,
    positions: Mutex<HashMap<SessionKey, i64>>,
}

impl SqlBroker {
    /// Create the broker tables if needed and return a broker over `pool`.
    pub async fn new(pool: SqlitePool, partitions: u32) -> Result<Self, BrokerError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await?;
        }
        info!(partitions, "sql broker ready");
        Ok(Self {
            pool,
            partitions: partitions.max(1),
            positions: Mutex::new(HashMap::new()),
        })
    }

    fn positions(&self) -> MutexGuard<'_, HashMap<SessionKey, i64>> {
        self.positions.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fetch_once(
        &self,
        group: &str,
        topic: &str,
        max_batch: usize,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let mut batch = Vec::new();
        for partition in 0..self.partitions {
            if batch.len() >= max_batch {
                break;
            }
            let session = (group.to_string(), topic.to_string(), partition);
            let cached = self.positions().get(&session).copied();
            let start = match cached {
                Some(pos) => pos,
                None => self.committed(group, topic, partition).await?.unwrap_or(0),
            };

            let rows = sqlx::query(
                "SELECT msg_offset, msg_key, payload, published_at
                 FROM broker_messages
                 WHERE topic = ?1 AND partition_id = ?2 AND msg_offset >= ?3
                 ORDER BY msg_offset
                 LIMIT ?4",
            )
            .bind(topic)
            .bind(partition as i64)
            .bind(start)
            .bind((max_batch - batch.len()) as i64)
            .fetch_all(&self.pool)
            .await?;

            let mut next = start;
            for row in rows {
                let offset: i64 = row.try_get("msg_offset")?;
                let published_ms: i64 = row.try_get("published_at")?;
                next = offset + 1;
                batch.push(BrokerMessage {
                    topic: topic.to_string(),
                    partition,
                    offset,
                    key: row.try_get("msg_key")?,
                    payload: row.try_get("payload")?,
                    published_at: Utc
                        .timestamp_millis_opt(published_ms)
                        .single()
                        .unwrap_or_else(Utc::now),
                });
            }
            self.positions().insert(session, next);
        }
        Ok(batch)
    }
}

#[async_trait]
impl Broker for SqlBroker {
    #[instrument(skip_all, fields(topic = %topic, key = %key))]
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Ack, BrokerError> {
        let partition = partition_for(key, self.partitions);
        // Single statement: SQLite runs it under the write lock, so concurrent
        // publishers cannot observe the same MAX(msg_offset).
        let offset: i64 = sqlx::query_scalar(
            "INSERT INTO broker_messages (topic, partition_id, msg_offset, msg_key, payload, published_at)
             SELECT ?1, ?2, COALESCE(MAX(msg_offset) + 1, 0), ?3, ?4, ?5
             FROM broker_messages WHERE topic = ?1 AND partition_id = ?2
             RETURNING msg_offset",
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(key)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        debug!(partition, offset, "message appended");
        Ok(Ack {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn subscribe(&self, group: &str, topic: &str) -> Result<(), BrokerError> {
        self.positions()
            .retain(|(g, t, _), _| !(g == group && t == topic));
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
            let batch = self.fetch_once(group, topic, max_batch).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
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
        sqlx::query(
            "INSERT INTO broker_group_offsets (group_id, topic, partition_id, committed_offset)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (group_id, topic, partition_id)
             DO UPDATE SET committed_offset = MAX(committed_offset, excluded.committed_offset)",
        )
        .bind(group)
        .bind(topic)
        .bind(partition as i64)
        .bind(offset)
        .execute(&self.pool)
        .await?;

        let mut positions = self.positions();
        let pos = positions
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(offset);
        *pos = (*pos).max(offset);
        Ok(())
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<i64>, BrokerError> {
        let offset = sqlx::query_scalar::<_, i64>(
            "SELECT committed_offset FROM broker_group_offsets
             WHERE group_id = ?1 AND topic = ?2 AND partition_id = ?3",
        )
        .bind(group)
        .bind(topic)
        .bind(partition as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(offset)
    }

    async fn lag(&self, group: &str, topic: &str) -> Result<u64, BrokerError> {
        let lag: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM broker_messages m
             LEFT JOIN broker_group_offsets o
               ON o.group_id = ?1 AND o.topic = m.topic AND o.partition_id = m.partition_id
             WHERE m.topic = ?2 AND m.msg_offset >= COALESCE(o.committed_offset, 0)",
        )
        .bind(group)
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;
        Ok(lag.max(0) as u64)
    }

    fn partitions(&self, _topic: &str) -> u32 {
        self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    const TOPIC: &str = "records";
    const GROUP: &str = "g1";
    const SHORT: Duration = Duration::from_millis(20);

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("sqlite memory")
    }

    #[tokio::test]
    async fn publish_and_poll() {
        let broker = SqlBroker::new(memory_pool().await, 1).await.unwrap();
        let a = broker.publish(TOPIC, "k1", b"one").await.unwrap();
        let b = broker.publish(TOPIC, "k2", b"two").await.unwrap();
        assert_eq!((a.offset, b.offset), (0, 1));

        let batch = broker.poll(GROUP, TOPIC, 10, SHORT).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].key, "k1");
        assert_eq!(batch[1].payload, b"two");
        assert!(broker.poll(GROUP, TOPIC, 10, SHORT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn committed_offsets_survive_a_new_broker_instance() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("log.db").display());

        {
            let pool = SqlitePool::connect(&url).await.unwrap();
            let broker = SqlBroker::new(pool, 1).await.unwrap();
            for i in 0..3 {
                broker.publish(TOPIC, &format!("k{i}"), b"x").await.unwrap();
            }
            let batch = broker.poll(GROUP, TOPIC, 1, SHORT).await.unwrap();
            broker.commit(GROUP, TOPIC, 0, batch[0].offset + 1).await.unwrap();
            // Read but never committed.
            assert_eq!(broker.poll(GROUP, TOPIC, 10, SHORT).await.unwrap().len(), 2);
        }

        let pool = SqlitePool::connect(&url).await.unwrap();
        let broker = SqlBroker::new(pool, 1).await.unwrap();
        broker.subscribe(GROUP, TOPIC).await.unwrap();
        let replay = broker.poll(GROUP, TOPIC, 10, SHORT).await.unwrap();
        assert_eq!(replay.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(broker.lag(GROUP, TOPIC).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn commit_is_monotonic() {
        let broker = SqlBroker::new(memory_pool().await, 2).await.unwrap();
        broker.commit(GROUP, TOPIC, 1, 4).await.unwrap();
        broker.commit(GROUP, TOPIC, 1, 2).await.unwrap();
        assert_eq!(broker.committed(GROUP, TOPIC, 1).await.unwrap(), Some(4));
        assert_eq!(broker.committed(GROUP, TOPIC, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lag_ignores_other_groups() {
        let broker = SqlBroker::new(memory_pool().await, 1).await.unwrap();
        broker.publish(TOPIC, "a", b"x").await.unwrap();
        broker.publish(TOPIC, "b", b"x").await.unwrap();
        broker.commit("other", TOPIC, 0, 2).await.unwrap();
        assert_eq!(broker.lag(GROUP, TOPIC).await.unwrap(), 2);
        assert_eq!(broker.lag("other", TOPIC).await.unwrap(), 0);
    }
}
