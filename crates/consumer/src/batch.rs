//! Decoding and in-batch deduplication of polled messages.

use std::collections::{BTreeMap, HashMap};

use siphon_core::Record;
use siphon_queue::BrokerMessage;

use crate::error::ConsumerError;

/// A polled batch ready to persist.
#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    /// One record per natural key: the version with the highest offset.
    pub records: Vec<Record>,
    /// Next offset to read per partition (highest processed offset + 1).
    pub commits: BTreeMap<u32, i64>,
    pub messages: usize,
    /// Older versions dropped because a later one was in the same batch.
    pub duplicates: usize,
}

impl PreparedBatch {
    /// Decode every message; the first undecodable one fails the batch.
    pub fn prepare(messages: &[BrokerMessage]) -> Result<Self, ConsumerError> {
        let mut latest: HashMap<String, (i64, Record)> = HashMap::with_capacity(messages.len());
        let mut commits: BTreeMap<u32, i64> = BTreeMap::new();
        let mut duplicates = 0;

        for message in messages {
            let record = Record::from_bytes(&message.payload).map_err(|e| ConsumerError::Decode {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                reason: e.to_string(),
            })?;

            let next = commits.entry(message.partition).or_insert(message.offset + 1);
            *next = (*next).max(message.offset + 1);

            // Keys are partition-affine, so offset order is publish order.
            match latest.get_mut(&record.natural_key) {
                Some(existing) => {
                    duplicates += 1;
                    if message.offset > existing.0 {
                        *existing = (message.offset, record);
                    }
                }
                None => {
                    latest.insert(record.natural_key.clone(), (message.offset, record));
                }
            }
        }

        let mut records: Vec<(i64, Record)> = latest.into_values().collect();
        records.sort_by_key(|(offset, _)| *offset);
        Ok(Self {
            records: records.into_iter().map(|(_, r)| r).collect(),
            commits,
            messages: messages.len(),
            duplicates,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }
}
