//! Durable consumer offsets (`consumer_offsets`).
//!
//! Written inside the same transaction as the records they cover, so a stored
//! offset never runs ahead of persisted data. The broker's own commit follows
//! the transaction.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::to_millis;
use crate::error::{map_constraint, StoreError};

pub struct OffsetStore;

impl OffsetStore {
    /// Record `offset` (next offset to read) for a partition. Never moves
    /// backwards.
    pub async fn save(
        conn: &mut SqliteConnection,
        group: &str,
        topic: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO consumer_offsets (group_id, topic, partition_id, committed_offset, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (group_id, topic, partition_id) DO UPDATE SET
                committed_offset = MAX(committed_offset, excluded.committed_offset),
                updated_at = excluded.updated_at",
        )
        .bind(group)
        .bind(topic)
        .bind(i64::from(partition))
        .bind(offset)
        .bind(to_millis(Utc::now()))
        .execute(conn)
        .await
        .map_err(|e| map_constraint(e, "consumer_offsets"))?;
        Ok(())
    }

    pub async fn get(
        pool: &SqlitePool,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<i64>, StoreError> {
        let offset = sqlx::query_scalar(
            "SELECT committed_offset FROM consumer_offsets
             WHERE group_id = ?1 AND topic = ?2 AND partition_id = ?3",
        )
        .bind(group)
        .bind(topic)
        .bind(i64::from(partition))
        .fetch_optional(pool)
        .await?;
        Ok(offset)
    }

    /// All stored (partition, offset) pairs for a group's topic.
    pub async fn load(
        pool: &SqlitePool,
        group: &str,
        topic: &str,
    ) -> Result<Vec<(u32, i64)>, StoreError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT partition_id, committed_offset FROM consumer_offsets
             WHERE group_id = ?1 AND topic = ?2
             ORDER BY partition_id",
        )
        .bind(group)
        .bind(topic)
        .fetch_all(pool)
        .await?;
        rows.into_iter()
            .map(|(partition, offset)| {
                u32::try_from(partition)
                    .map(|p| (p, offset))
                    .map_err(|_| StoreError::Decode(format!("partition {partition}")))
            })
            .collect()
    }

    /// Sum of stored offsets for a group's topic.
    pub async fn total(pool: &SqlitePool, group: &str, topic: &str) -> Result<i64, StoreError> {
        let sum: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(committed_offset) FROM consumer_offsets WHERE group_id = ?1 AND topic = ?2",
        )
        .bind(group)
        .bind(topic)
        .fetch_one(pool)
        .await?;
        Ok(sum.unwrap_or(0))
    }
}
