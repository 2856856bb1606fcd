//! Broker error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("invalid partition {partition} for topic '{topic}'")]
    InvalidPartition { topic: String, partition: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
