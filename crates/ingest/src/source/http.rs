use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use tracing::debug;

use super::traits::{FetchWindow, ItemSource, Page, SourceError};

/// Item listing API over HTTP.
///
/// `GET {base_url}/{collection}?after=..&before=..&limit=..[&cursor=..]`
/// answering `{"items": [...], "next": "<cursor>" | null}`.
pub struct HttpSource {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpSource {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        api_token: Option<String>,
    ) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn request(
        &self,
        collection: &str,
        window: &FetchWindow,
        cursor: Option<&str>,
        limit: u32,
    ) -> RequestBuilder {
        let mut query = vec![
            ("after", window.after.to_rfc3339()),
            ("before", window.before.to_rfc3339()),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let mut request = self
            .client
            .get(format!("{}/{}", self.base_url, collection))
            .query(&query);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        request
    }
}

#[async_trait]
impl ItemSource for HttpSource {
    async fn fetch_page(
        &self,
        collection: &str,
        window: &FetchWindow,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page, SourceError> {
        let response = self.request(collection, window, cursor, limit).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api { status, body });
        }

        let bytes = response.bytes().await?;
        let page: Page = serde_json::from_slice(&bytes)
            .map_err(|e| SourceError::Decode(format!("{collection}: {e}")))?;
        debug!(
            collection,
            items = page.items.len(),
            has_next = page.next.is_some(),
            "fetched page"
        );
        Ok(page)
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}
