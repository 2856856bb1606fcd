use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("config error: {0}")]
    Config(String),
}
