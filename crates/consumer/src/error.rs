use siphon_queue::BrokerError;
use siphon_storage::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("undecodable message {topic}/{partition}@{offset}: {reason}")]
    Decode {
        topic: String,
        partition: u32,
        offset: i64,
        reason: String,
    },

    /// A write failed for a reason other than a constraint violation.
    #[error("persistence error: {0}")]
    Persistence(StoreError),

    /// A constraint other than the natural-key upsert was violated.
    #[error("persistence conflict: {0}")]
    Conflict(String),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl From<StoreError> for ConsumerError {
    fn from(e: StoreError) -> Self {
        if e.is_conflict() {
            Self::Conflict(e.to_string())
        } else {
            Self::Persistence(e)
        }
    }
}

impl From<sqlx::Error> for ConsumerError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::from(e).into()
    }
}

impl ConsumerError {
    /// Retrying the same batch cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_fatal() {
        let err: ConsumerError = StoreError::Conflict("records: CHECK constraint failed".into()).into();
        assert!(matches!(err, ConsumerError::Conflict(_)));
        assert!(err.is_fatal());

        let err: ConsumerError = StoreError::NotFound("x".into()).into();
        assert!(matches!(err, ConsumerError::Persistence(_)));
        assert!(!err.is_fatal());

        assert!(!ConsumerError::Broker(BrokerError::Timeout(10)).is_fatal());
    }
}
