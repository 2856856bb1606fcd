//! Consumer worker: drains the record topic into the state store with
//! at-least-once delivery and idempotent writes.

pub mod batch;
pub mod config;
pub mod error;
pub mod worker;

pub use batch::PreparedBatch;
pub use config::ConsumerConfig;
pub use error::ConsumerError;
pub use worker::{BatchOutcome, ConsumerWorker, WorkerStats};
