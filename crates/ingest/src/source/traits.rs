use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
}

impl SourceError {
    /// Timeouts, connection failures, throttling and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::UnknownCollection(_) => false,
        }
    }
}

/// Half-open fetch window `[after, before)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub after: DateTime<Utc>,
    pub before: DateTime<Utc>,
}

impl FetchWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.after && ts < self.before
    }
}

/// One page of raw items.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    /// Cursor for the following page; `None` on the last one.
    #[serde(default)]
    pub next: Option<String>,
}

/// A paged listing of items per collection.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Fetch up to `limit` items of `collection` inside `window`, continuing
    /// from `cursor`.
    async fn fetch_page(
        &self,
        collection: &str,
        window: &FetchWindow,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page, SourceError>;

    fn name(&self) -> &str;
}

#[async_trait]
impl<T: ItemSource + ?Sized> ItemSource for Arc<T> {
    async fn fetch_page(
        &self,
        collection: &str,
        window: &FetchWindow,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page, SourceError> {
        (**self).fetch_page(collection, window, cursor, limit).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
