//! The siphon process: wiring, admin HTTP API and run loops.

pub mod api;
pub mod app;
pub mod router;

pub use app::{App, Components};
pub use router::build_router;
