//! The producer task action.
//!
//! One run fetches the collection's items for `[window_start, logical_ts)`,
//! page by page, normalizes them and publishes each record keyed by its
//! natural key. The run succeeds only once every publish is acknowledged;
//! records published before a failure stay published, which is safe because
//! persistence downstream is idempotent on the natural key.
//!
//! A window holding more than `max_items` fails the run instead of
//! succeeding with a partial window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use siphon_queue::Broker;
use siphon_scheduler::{RunContext, RunResult, TaskAction, TaskError};
use tracing::{debug, info, warn};

use crate::normalize::Normalizer;
use crate::source::{FetchWindow, ItemSource};

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub collection: String,
    pub topic: String,
    pub page_size: u32,
    /// Upper bound on items fetched per run. Exceeding it fails the run.
    pub max_items: usize,
    pub publish_timeout: Duration,
}

impl ProducerConfig {
    pub fn new(collection: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            topic: topic.into(),
            page_size: 100,
            max_items: 1000,
            publish_timeout: Duration::from_secs(60),
        }
    }
}

/// Counters for one produce call, stored as the run summary detail.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProduceReport {
    pub collection: String,
    pub pages: u32,
    pub fetched: u64,
    pub published: u64,
    /// Items dropped because they had no usable id.
    pub skipped: u64,
}

pub struct ProducerTask {
    source: Arc<dyn ItemSource>,
    broker: Arc<dyn Broker>,
    normalizer: Normalizer,
    config: ProducerConfig,
}

impl ProducerTask {
    pub fn new(
        source: Arc<dyn ItemSource>,
        broker: Arc<dyn Broker>,
        normalizer: Normalizer,
        config: ProducerConfig,
    ) -> Self {
        Self {
            source,
            broker,
            normalizer,
            config,
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Fetch and publish the items of the run's window.
    pub async fn produce(&self, ctx: &RunContext) -> Result<ProduceReport, TaskError> {
        let window = FetchWindow {
            after: ctx.window_start,
            before: ctx.logical_ts,
        };
        let collection = self.config.collection.as_str();
        let mut report = ProduceReport {
            collection: collection.to_string(),
            ..Default::default()
        };
        let mut cursor: Option<String> = None;

        loop {
            ctx.check_cancelled()?;
            let fetch = self.source.fetch_page(
                collection,
                &window,
                cursor.as_deref(),
                self.config.page_size,
            );
            let page = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(TaskError::Cancelled),
                page = fetch => page.map_err(|e| {
                    let transient = e.is_transient();
                    warn!(
                        task = %ctx.task_name,
                        collection,
                        transient,
                        error = %e,
                        "source fetch failed"
                    );
                    if transient {
                        TaskError::Source(e.to_string())
                    } else {
                        TaskError::Rejected(e.to_string())
                    }
                })?,
            };
            report.pages += 1;
            debug!(
                task = %ctx.task_name,
                collection,
                page = report.pages,
                items = page.items.len(),
                "page fetched"
            );

            for item in page.items {
                if report.fetched as usize >= self.config.max_items {
                    warn!(
                        task = %ctx.task_name,
                        collection,
                        logical_ts = %ctx.logical_ts,
                        max_items = self.config.max_items,
                        published = report.published,
                        "window exceeds max_items; failing run"
                    );
                    return Err(TaskError::Truncated {
                        limit: self.config.max_items,
                        published: report.published,
                    });
                }
                report.fetched += 1;

                let Some(record) = self.normalizer.normalize(collection, item, ctx.logical_ts)
                else {
                    report.skipped += 1;
                    continue;
                };
                ctx.check_cancelled()?;
                self.publish(ctx, &record).await?;
                report.published += 1;
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if report.skipped > 0 {
            warn!(
                task = %ctx.task_name,
                collection,
                skipped = report.skipped,
                "items without an id were skipped"
            );
        }
        info!(
            task = %ctx.task_name,
            collection,
            logical_ts = %ctx.logical_ts,
            fetched = report.fetched,
            published = report.published,
            "produce complete"
        );
        Ok(report)
    }

    async fn publish(&self, ctx: &RunContext, record: &siphon_core::Record) -> Result<(), TaskError> {
        let payload = record
            .to_bytes()
            .map_err(|e| TaskError::Failed(format!("encode {}: {e}", record.natural_key)))?;
        let publish = self
            .broker
            .publish(&self.config.topic, &record.natural_key, &payload);

        let ack = match tokio::time::timeout(self.config.publish_timeout, publish).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                warn!(key = %record.natural_key, error = %e, "delivery failed");
                return Err(TaskError::Publish(e.to_string()));
            }
            Err(_) => {
                warn!(key = %record.natural_key, "delivery timed out");
                return Err(TaskError::Publish(format!(
                    "no ack for {} within {:?}",
                    record.natural_key, self.config.publish_timeout
                )));
            }
        };
        debug!(
            task = %ctx.task_name,
            key = %record.natural_key,
            topic = %ack.topic,
            partition = ack.partition,
            offset = ack.offset,
            "delivered"
        );
        Ok(())
    }
}

#[async_trait]
impl TaskAction for ProducerTask {
    async fn run(&self, ctx: RunContext) -> Result<RunResult, TaskError> {
        let report = self.produce(&ctx).await?;
        Ok(RunResult {
            processed: report.published,
            detail: serde_json::to_value(&report).unwrap_or_default(),
        })
    }
}
