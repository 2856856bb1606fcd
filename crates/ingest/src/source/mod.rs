pub mod fixed;
pub mod http;
pub mod traits;

pub use fixed::StaticSource;
pub use http::HttpSource;
pub use traits::{FetchWindow, ItemSource, Page, SourceError};
