//! SQLite-backed state store: scheduler runs, ingested records, consumer
//! offsets and task controls in one database.

pub mod control;
pub mod db;
pub mod error;
pub mod offset;
pub mod record;
pub mod run;

pub use control::ControlStore;
pub use db::{connect, in_memory, migrate};
pub use error::StoreError;
pub use offset::OffsetStore;
pub use record::{RecordStore, StoredRecord, UpsertCounts, UpsertOutcome};
pub use run::{NewRun, Run, RunFilter, RunState, RunStore, RunUpdate, TriggerKind};

pub use sqlx::SqlitePool;
