use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::traits::{FetchWindow, ItemSource, Page, SourceError};

/// Serves a fixed set of items per collection.
///
/// With a time field configured, only items whose timestamp (RFC 3339 string
/// or epoch seconds) falls inside the fetch window are returned; items
/// without one always are. Cursors are item offsets.
#[derive(Default)]
pub struct StaticSource {
    collections: RwLock<HashMap<String, Vec<Value>>>,
    time_field: Option<String>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(self, collection: &str, items: Vec<Value>) -> Self {
        self.set_items(collection, items);
        self
    }

    pub fn with_time_field(mut self, field: impl Into<String>) -> Self {
        self.time_field = Some(field.into());
        self
    }

    /// Replace the items served for `collection`.
    pub fn set_items(&self, collection: &str, items: Vec<Value>) {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections.insert(collection.to_string(), items);
    }

    fn in_window(&self, item: &Value, window: &FetchWindow) -> bool {
        let Some(field) = &self.time_field else {
            return true;
        };
        match item_time(&item[field.as_str()]) {
            Some(ts) => window.contains(ts),
            None => true,
        }
    }
}

fn item_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

#[async_trait]
impl ItemSource for StaticSource {
    async fn fetch_page(
        &self,
        collection: &str,
        window: &FetchWindow,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page, SourceError> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        let items = collections
            .get(collection)
            .ok_or_else(|| SourceError::UnknownCollection(collection.to_string()))?;

        let start = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| SourceError::Decode(format!("bad cursor '{c}'")))?,
            None => 0,
        };
        let matching: Vec<&Value> = items.iter().filter(|i| self.in_window(i, window)).collect();
        let end = (start + limit.max(1) as usize).min(matching.len());

        Ok(Page {
            items: matching
                .get(start..end)
                .unwrap_or_default()
                .iter()
                .map(|v| (*v).clone())
                .collect(),
            next: (end < matching.len()).then(|| end.to_string()),
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}
