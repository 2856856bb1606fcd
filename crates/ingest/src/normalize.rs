use chrono::{DateTime, Utc};
use serde_json::Value;
use siphon_core::{natural_key, Record};

/// Turns raw source items into records keyed by `{scope}:{id}`.
///
/// The scope is the item's `scope_field` when configured and present,
/// otherwise the collection name.
#[derive(Debug, Clone)]
pub struct Normalizer {
    id_field: String,
    scope_field: Option<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new("id", None)
    }
}

impl Normalizer {
    pub fn new(id_field: impl Into<String>, scope_field: Option<String>) -> Self {
        Self {
            id_field: id_field.into(),
            scope_field,
        }
    }

    /// `None` when the item has no usable id.
    pub fn normalize(
        &self,
        collection: &str,
        item: Value,
        logical_ts: DateTime<Utc>,
    ) -> Option<Record> {
        let id = key_part(&item[self.id_field.as_str()])?;
        let scope = self
            .scope_field
            .as_deref()
            .and_then(|f| key_part(&item[f]))
            .unwrap_or_else(|| collection.to_string());
        Record::new(natural_key(&scope, &id), collection, item, logical_ts).ok()
    }
}

fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_by_collection_and_id() {
        let n = Normalizer::default();
        let record = n.normalize("rust", json!({"id": "abc", "title": "t"}), Utc::now()).unwrap();
        assert_eq!(record.natural_key, "rust:abc");
        assert_eq!(record.source, "rust");
        assert_eq!(record.payload["title"], "t");

        let numeric = n.normalize("rust", json!({"id": 42}), Utc::now()).unwrap();
        assert_eq!(numeric.natural_key, "rust:42");
    }

    #[test]
    fn scope_field_overrides_collection() {
        let n = Normalizer::new("name", Some("subreddit".into()));
        let record = n
            .normalize("all", json!({"name": "t3_x", "subreddit": "golang"}), Utc::now())
            .unwrap();
        assert_eq!(record.natural_key, "golang:t3_x");

        let fallback = n.normalize("all", json!({"name": "t3_y"}), Utc::now()).unwrap();
        assert_eq!(fallback.natural_key, "all:t3_y");
    }

    #[test]
    fn items_without_id_are_dropped() {
        let n = Normalizer::default();
        assert!(n.normalize("rust", json!({"title": "no id"}), Utc::now()).is_none());
        assert!(n.normalize("rust", json!({"id": "  "}), Utc::now()).is_none());
        assert!(n.normalize("rust", json!({"id": null}), Utc::now()).is_none());
        assert!(n.normalize("rust", json!([1, 2]), Utc::now()).is_none());
    }
}
