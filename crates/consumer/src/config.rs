use std::time::Duration;

use serde::{Deserialize, Serialize};
use siphon_core::config::ConsumerSettings;

/// Consumer worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Fixed per deployment so committed offsets survive restarts.
    pub group_id: String,
    pub topic: String,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Consecutive failures of one batch before it is dead-lettered.
    #[serde(default)]
    pub dead_letter_after: Option<u32>,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
}

fn default_max_batch() -> usize { 100 }
fn default_poll_timeout_ms() -> u64 { 10_000 }
fn default_backoff_base_ms() -> u64 { 500 }
fn default_backoff_cap_ms() -> u64 { 30_000 }

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            max_batch: default_max_batch(),
            poll_timeout_ms: default_poll_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            dead_letter_after: None,
            dead_letter_topic: None,
        }
    }

    pub fn from_settings(settings: &ConsumerSettings, topic: &str) -> Self {
        Self {
            group_id: settings.group_id.clone(),
            topic: topic.to_string(),
            max_batch: settings.max_batch.max(1),
            poll_timeout_ms: settings.poll_timeout_ms,
            backoff_base_ms: settings.retry_backoff_base_ms,
            backoff_cap_ms: settings.retry_backoff_cap_ms,
            dead_letter_after: settings.dead_letter_after,
            dead_letter_topic: settings.dead_letter_topic.clone(),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Delay before retrying a batch after its `failures`-th failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(ms.min(self.backoff_cap_ms))
    }

    /// Dead-lettering is on when either the threshold or the topic is set.
    pub fn dead_letter(&self) -> Option<(u32, String)> {
        if self.dead_letter_after.is_none() && self.dead_letter_topic.is_none() {
            return None;
        }
        let after = self.dead_letter_after.unwrap_or(5).max(1);
        let topic = self
            .dead_letter_topic
            .clone()
            .unwrap_or_else(|| format!("{}.dead-letter", self.topic));
        Some((after, topic))
    }
}
