//! The scheduling engine: tick, dispatch, execution and operator controls.

mod control;
mod core;
mod execution;
mod scheduling;


pub use self::control::{Liveness, TaskStatus};
pub use self::core::Scheduler;
pub use self::scheduling::TickReport;
