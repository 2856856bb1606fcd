//! Ingested records, keyed by natural key.

use chrono::{DateTime, Utc};
use serde::Serialize;
use siphon_core::Record;
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::{from_millis, opt_from_millis, to_millis};
use crate::error::{map_constraint, StoreError};

/// A row of the `records` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub natural_key: String,
    pub source: String,
    pub payload: serde_json::Value,
    pub logical_ts: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped each time the payload actually changes.
    pub version: i64,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    natural_key: String,
    source: String,
    payload: String,
    logical_ts: Option<i64>,
    fetched_at: i64,
    ingested_at: i64,
    updated_at: i64,
    version: i64,
}

impl TryFrom<RecordRow> for StoredRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| StoreError::Decode(format!("record {}: {e}", row.natural_key)))?;
        Ok(Self {
            payload,
            logical_ts: opt_from_millis(row.logical_ts)?,
            fetched_at: from_millis(row.fetched_at)?,
            ingested_at: from_millis(row.ingested_at)?,
            updated_at: from_millis(row.updated_at)?,
            version: row.version,
            natural_key: row.natural_key,
            source: row.source,
        })
    }
}

/// What an upsert did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Per-batch upsert counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl UpsertCounts {
    pub fn add(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

/// Stateless store for `records`.
///
/// Writers go through [`RecordStore::upsert`] on a caller-owned transaction;
/// everything else is read-only.
pub struct RecordStore;

impl RecordStore {
    /// Idempotent insert-or-replace keyed on the natural key.
    ///
    /// Conflicts on the natural key are the expected path and update the row.
    /// Any other constraint violation surfaces as [`StoreError::Conflict`].
    pub async fn upsert(
        conn: &mut SqliteConnection,
        record: &Record,
    ) -> Result<UpsertOutcome, StoreError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| StoreError::Decode(format!("record {}: {e}", record.natural_key)))?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT payload FROM records WHERE natural_key = ?1")
                .bind(&record.natural_key)
                .fetch_optional(&mut *conn)
                .await?;

        let outcome = match existing.as_deref() {
            None => UpsertOutcome::Inserted,
            Some(old) if old == payload => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };

        let now = to_millis(Utc::now());
        sqlx::query(
            "INSERT INTO records
                (natural_key, source, payload, logical_ts, fetched_at, ingested_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1)
             ON CONFLICT (natural_key) DO UPDATE SET
                source = excluded.source,
                payload = excluded.payload,
                logical_ts = excluded.logical_ts,
                fetched_at = excluded.fetched_at,
                updated_at = excluded.updated_at,
                version = records.version + (records.payload IS NOT excluded.payload)",
        )
        .bind(&record.natural_key)
        .bind(&record.source)
        .bind(&payload)
        .bind(to_millis(record.logical_ts))
        .bind(to_millis(record.fetched_at))
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_constraint(e, "records"))?;

        Ok(outcome)
    }

    /// Upsert a batch in one transaction: all rows land or none do.
    pub async fn upsert_batch(
        pool: &SqlitePool,
        records: &[Record],
    ) -> Result<UpsertCounts, StoreError> {
        let mut tx = pool.begin().await?;
        let mut counts = UpsertCounts::default();
        for record in records {
            counts.add(Self::upsert(&mut *tx, record).await?);
        }
        tx.commit().await?;
        Ok(counts)
    }

    pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>("SELECT * FROM records WHERE natural_key = ?1")
            .bind(key)
            .fetch_optional(pool)
            .await?;
        row.map(StoredRecord::try_from).transpose()
    }

    pub async fn count(pool: &SqlitePool) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Page through records, most recently updated first.
    pub async fn list(
        pool: &SqlitePool,
        source: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            "SELECT * FROM records
             WHERE (?1 IS NULL OR source = ?1)
             ORDER BY updated_at DESC, natural_key
             LIMIT ?2 OFFSET ?3",
        )
        .bind(source)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(pool)
        .await?;
        rows.into_iter().map(StoredRecord::try_from).collect()
    }
}
