//! Task scheduling: triggers, the dependency graph, retry policy and the run
//! engine that turns due logical timestamps into executed runs.

pub mod config;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod task;
pub mod trigger;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, TaskError};
pub use graph::TaskGraph;
pub use metrics::SchedulerMetrics;
pub use pipeline::{PipelineFile, TaskDef, PRODUCE_ACTION};
pub use retry::RetryPolicy;
pub use runner::{Liveness, Scheduler, TaskStatus, TickReport};
pub use task::{RunContext, RunResult, TaskAction, TaskOptions, TaskSpec, TriggerRule};
pub use trigger::Trigger;
