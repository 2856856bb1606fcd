use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A normalized unit of harvested data.
///
/// The `natural_key` is derived from the source item's identity and is the
/// unique key in the `records` table, so re-ingesting the same item replaces
/// the row instead of duplicating it. It is also the broker message key, which
/// pins every version of an item to one partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub natural_key: String,
    /// Name of the collection (source scope) the item was harvested from.
    pub source: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    /// Logical timestamp of the run that produced this version.
    pub logical_ts: DateTime<Utc>,
}

impl Record {
    pub fn new(
        natural_key: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
        logical_ts: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        let natural_key = natural_key.into();
        if natural_key.trim().is_empty() {
            return Err(CoreError::InvalidRecord("natural key is empty".into()));
        }
        Ok(Self {
            natural_key,
            source: source.into(),
            payload,
            fetched_at: Utc::now(),
            logical_ts,
        })
    }

    /// Serialize to the broker message value.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a broker message value.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let record: Record = serde_json::from_slice(bytes)?;
        if record.natural_key.trim().is_empty() {
            return Err(CoreError::InvalidRecord("natural key is empty".into()));
        }
        Ok(record)
    }
}

/// Build a natural key from a source scope and the item's id within it.
pub fn natural_key(scope: &str, id: &str) -> String {
    format!("{}:{}", scope, id)
}
