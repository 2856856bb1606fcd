//! The consumer loop.
//!
//! Each polled batch is decoded, deduplicated and written in one state-store
//! transaction together with the group's next offsets; the broker commit
//! follows. A batch that fails to persist is retried with backoff and its
//! offsets never advance, so the topic acts as the retry queue.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use siphon_queue::{Broker, BrokerMessage};
use siphon_storage::{OffsetStore, RecordStore, SqlitePool, UpsertCounts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::PreparedBatch;
use crate::config::ConsumerConfig;
use crate::error::ConsumerError;

/// Totals over a worker's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub messages: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub duplicates: u64,
    /// Failed attempts to persist a batch.
    pub failures: u64,
    pub dead_lettered: u64,
}

impl WorkerStats {
    fn record_batch(&mut self, outcome: &BatchOutcome) {
        self.batches += 1;
        self.messages += outcome.messages as u64;
        self.inserted += outcome.counts.inserted;
        self.updated += outcome.counts.updated;
        self.unchanged += outcome.counts.unchanged;
        self.duplicates += outcome.duplicates as u64;
    }
}

/// Result of persisting one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub messages: usize,
    pub duplicates: usize,
    pub counts: UpsertCounts,
}

pub struct ConsumerWorker {
    broker: Arc<dyn Broker>,
    pool: SqlitePool,
    config: ConsumerConfig,
}

impl ConsumerWorker {
    pub fn new(broker: Arc<dyn Broker>, pool: SqlitePool, config: ConsumerConfig) -> Self {
        Self {
            broker,
            pool,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Bring the broker's committed offsets up to the ones recorded in the
    /// state store, then start a consumer session.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let (group, topic) = (&self.config.group_id, &self.config.topic);
        for (partition, offset) in OffsetStore::load(&self.pool, group, topic).await? {
            let committed = self.broker.committed(group, topic, partition).await?;
            if committed.map_or(true, |c| c < offset) {
                info!(
                    group = %group,
                    topic = %topic,
                    partition,
                    offset,
                    broker_offset = ?committed,
                    "restoring broker offset from state store"
                );
                self.broker.commit(group, topic, partition, offset).await?;
            }
        }
        self.broker.subscribe(group, topic).await?;
        Ok(())
    }

    /// Consume until `shutdown` fires.
    ///
    /// Returns an error only for failures retrying cannot fix (undecodable
    /// messages or persistence conflicts) when dead-lettering is off.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerStats, ConsumerError> {
        self.start().await?;
        info!(
            group = %self.config.group_id,
            topic = %self.config.topic,
            max_batch = self.config.max_batch,
            "consumer worker started"
        );

        let mut stats = WorkerStats::default();
        let mut poll_failures = 0u32;

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.broker.poll(
                    &self.config.group_id,
                    &self.config.topic,
                    self.config.max_batch,
                    self.config.poll_timeout(),
                ) => polled,
            };

            let messages = match polled {
                Ok(messages) => {
                    poll_failures = 0;
                    messages
                }
                Err(e) => {
                    poll_failures += 1;
                    let delay = self.config.backoff(poll_failures);
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "poll failed");
                    if !sleep_or_shutdown(delay, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            if messages.is_empty() {
                continue;
            }

            match self.handle(&messages, &mut stats, &shutdown).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(
                        group = %self.config.group_id,
                        error = %e,
                        "consumer stopping: batch cannot be persisted"
                    );
                    return Err(e);
                }
            }
        }

        info!(
            batches = stats.batches,
            messages = stats.messages,
            inserted = stats.inserted,
            updated = stats.updated,
            failures = stats.failures,
            "consumer worker stopped"
        );
        Ok(stats)
    }

    /// Persist one batch, retrying until it succeeds, is dead-lettered or
    /// shutdown is requested (`Ok(false)`).
    async fn handle(
        &self,
        messages: &[BrokerMessage],
        stats: &mut WorkerStats,
        shutdown: &CancellationToken,
    ) -> Result<bool, ConsumerError> {
        let dead_letter = self.config.dead_letter();
        let mut failures = 0u32;
        loop {
            let err = match self.process_batch(messages).await {
                Ok(outcome) => {
                    stats.record_batch(&outcome);
                    return Ok(true);
                }
                Err(e) => e,
            };
            failures += 1;
            stats.failures += 1;

            if let Some((after, topic)) = &dead_letter {
                if err.is_fatal() || failures >= *after {
                    warn!(failures, error = %err, "batch failed; isolating bad messages");
                    self.isolate(messages, topic, stats).await?;
                    return Ok(true);
                }
            }
            if err.is_fatal() {
                return Err(err);
            }

            let delay = self.config.backoff(failures);
            warn!(
                group = %self.config.group_id,
                failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "batch not persisted; retrying"
            );
            if !sleep_or_shutdown(delay, shutdown).await {
                return Ok(false);
            }
        }
    }

    /// Write a batch and advance the group's offsets past it.
    pub async fn process_batch(
        &self,
        messages: &[BrokerMessage],
    ) -> Result<BatchOutcome, ConsumerError> {
        let batch = PreparedBatch::prepare(messages)?;
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut tx = self.pool.begin().await?;
        let mut counts = UpsertCounts::default();
        for record in &batch.records {
            counts.add(RecordStore::upsert(&mut *tx, record).await?);
        }
        for (&partition, &next) in &batch.commits {
            OffsetStore::save(&mut *tx, &self.config.group_id, &self.config.topic, partition, next)
                .await?;
        }
        tx.commit().await?;

        self.commit_broker(&batch).await;
        debug!(
            messages = batch.messages,
            inserted = counts.inserted,
            updated = counts.updated,
            unchanged = counts.unchanged,
            duplicates = batch.duplicates,
            "batch persisted"
        );
        Ok(BatchOutcome {
            messages: batch.messages,
            duplicates: batch.duplicates,
            counts,
        })
    }

    /// Broker commits after the store commit. A failure here is recovered by
    /// [`ConsumerWorker::start`] on the next session.
    async fn commit_broker(&self, batch: &PreparedBatch) {
        for (&partition, &next) in &batch.commits {
            if let Err(e) = self
                .broker
                .commit(&self.config.group_id, &self.config.topic, partition, next)
                .await
            {
                warn!(partition, offset = next, error = %e, "broker commit failed");
            }
        }
    }

    /// Persist a failed batch one message at a time, dead-lettering each
    /// message that still fails.
    async fn isolate(
        &self,
        messages: &[BrokerMessage],
        topic: &str,
        stats: &mut WorkerStats,
    ) -> Result<(), ConsumerError> {
        for message in messages {
            let single = std::slice::from_ref(message);
            match self.process_batch(single).await {
                Ok(outcome) => stats.record_batch(&outcome),
                Err(e) => {
                    warn!(
                        partition = message.partition,
                        offset = message.offset,
                        key = %message.key,
                        dead_letter_topic = %topic,
                        error = %e,
                        "message dead-lettered"
                    );
                    self.dead_letter(single, topic).await?;
                    stats.dead_lettered += 1;
                }
            }
        }
        Ok(())
    }

    /// Move messages to the dead-letter topic and skip past them.
    async fn dead_letter(
        &self,
        messages: &[BrokerMessage],
        topic: &str,
    ) -> Result<(), ConsumerError> {
        let mut commits = std::collections::BTreeMap::new();
        for message in messages {
            self.broker.publish(topic, &message.key, &message.payload).await?;
            let next = commits.entry(message.partition).or_insert(message.offset + 1);
            *next = (*next).max(message.offset + 1);
        }

        let mut conn = self.pool.acquire().await?;
        for (&partition, &next) in &commits {
            OffsetStore::save(&mut *conn, &self.config.group_id, &self.config.topic, partition, next)
                .await?;
        }
        drop(conn);

        self.commit_broker(&PreparedBatch {
            commits,
            ..Default::default()
        })
        .await;
        Ok(())
    }
}

/// `false` when shutdown fired first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
