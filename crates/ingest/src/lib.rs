//! Producer side of the pipeline: fetch items from an external source for a
//! run's time window, normalize them into records and publish them.

pub mod normalize;
pub mod producer;
pub mod source;

pub use normalize::Normalizer;
pub use producer::{ProduceReport, ProducerConfig, ProducerTask};
pub use source::{FetchWindow, HttpSource, ItemSource, Page, SourceError, StaticSource};
