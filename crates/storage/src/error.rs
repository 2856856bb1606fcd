use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A constraint was violated outside the expected upsert path. Not
    /// retryable: it means the data broke a model assumption.
    #[error("persistence conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid run transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("corrupt row: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// True when retrying the same write cannot succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Decode(_))
    }

    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::InvalidTransition { .. } => 409,
            Self::Decode(_) | Self::Database(_) | Self::Migration(_) => 500,
        }
    }
}

/// Map SQLite constraint violations to [`StoreError::Conflict`].
pub(crate) fn map_constraint(e: sqlx::Error, context: &str) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        use sqlx::error::ErrorKind;
        match db_err.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::CheckViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::ForeignKeyViolation => {
                return StoreError::Conflict(format!("{context}: {}", db_err.message()));
            }
            _ => {}
        }
    }
    error!(error = %e, context, "state store database error");
    StoreError::Database(e)
}
