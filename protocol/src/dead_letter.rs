//! # Dead Letter Queue
//!
//! Last-resort persistence for settlement notifications that exhausted every
//! retry. Entries are append-only; the only way one leaves the queue is an
//! explicit operator [`DeadLetterQueue::remove`].
//!
//! ## Key layout
//!
//! | Tree           | Key                                  | Value                    |
//! |----------------|--------------------------------------|--------------------------|
//! | `dead_letters` | `{unix_nanos:020}-{payment_reference}` | `json(DeadLetterEntry)` |
//!
//! The zero-padded nanosecond prefix makes sled's lexicographic order match
//! arrival order, so time-range scans are plain range queries. Values are
//! JSON rather than bincode because the payload is an arbitrary
//! `serde_json::Value` and operators read these by hand.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{IVec, Tree};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};

/// Errors from the dead-letter store.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dead letter '{0}' not found")]
    NotFound(String),
}

/// A settlement attempt nobody could complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Storage key; stable handle for inspection and removal.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub payment_reference: String,
    pub intent_id: String,
    /// The notification exactly as it was received.
    pub payload: serde_json::Value,
    /// Display form of the last error observed.
    pub error: String,
    pub attempts: u32,
}

/// What the executor hands over on exhaustion.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub payment_reference: String,
    pub intent_id: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts: u32,
}

/// Append-only sink the settlement executor writes to.
pub trait DeadLetterSink: Send + Sync {
    fn append(&self, letter: DeadLetter) -> Result<DeadLetterEntry, DeadLetterError>;

    /// Number of entries currently held. Must not block on I/O beyond a
    /// local read.
    fn depth(&self) -> usize;
}

/// Durable queue in a sled tree.
#[derive(Clone)]
pub struct DeadLetterQueue {
    tree: Tree,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    pub fn new(tree: Tree) -> Self {
        Self::with_clock(tree, Arc::new(SystemClock))
    }

    pub fn with_clock(tree: Tree, clock: Arc<dyn Clock>) -> Self {
        Self { tree, clock }
    }

    /// Oldest-first listing, at most `limit` entries.
    pub fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.tree
            .iter()
            .take(limit)
            .map(|item| decode(&item?.1))
            .collect()
    }

    /// Entries whose arrival time falls in `[from, to)`.
    pub fn list_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let start = time_prefix(from);
        let end = time_prefix(to);
        self.tree
            .range(start.as_bytes()..end.as_bytes())
            .map(|item| decode(&item?.1))
            .collect()
    }

    /// Every entry for one payment reference, oldest first.
    pub fn list_by_reference(
        &self,
        payment_reference: &str,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let entry = decode(&item?.1)?;
            if entry.payment_reference == payment_reference {
                out.push(entry);
            }
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        self.tree.get(id)?.map(|raw| decode(&raw)).transpose()
    }

    /// Operator action: drop an entry after it has been dealt with.
    pub fn remove(&self, id: &str) -> Result<DeadLetterEntry, DeadLetterError> {
        let raw = self
            .tree
            .remove(id)?
            .ok_or_else(|| DeadLetterError::NotFound(id.to_string()))?;
        self.tree.flush()?;
        let entry = decode(&raw)?;
        tracing::info!(id, payment_reference = %entry.payment_reference, "dead letter removed");
        Ok(entry)
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn append(&self, letter: DeadLetter) -> Result<DeadLetterEntry, DeadLetterError> {
        let timestamp = self.clock.now();
        let mut nanos = unix_nanos(timestamp);
        loop {
            let id = format!("{nanos:020}-{}", letter.payment_reference);
            let entry = DeadLetterEntry {
                id: id.clone(),
                timestamp,
                payment_reference: letter.payment_reference.clone(),
                intent_id: letter.intent_id.clone(),
                payload: letter.payload.clone(),
                error: letter.error.clone(),
                attempts: letter.attempts,
            };
            let value = serde_json::to_vec(&entry)?;
            // Never overwrite: a key collision moves to the next nanosecond.
            if self
                .tree
                .compare_and_swap(id.as_str(), None::<IVec>, Some(value))?
                .is_ok()
            {
                self.tree.flush()?;
                tracing::warn!(
                    id = %entry.id,
                    intent_id = %entry.intent_id,
                    payment_reference = %entry.payment_reference,
                    attempts = entry.attempts,
                    error = %entry.error,
                    "settlement routed to dead letter queue"
                );
                return Ok(entry);
            }
            nanos += 1;
        }
    }

    fn depth(&self) -> usize {
        self.tree.len()
    }
}

fn unix_nanos(at: DateTime<Utc>) -> u64 {
    at.timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0)
}

fn time_prefix(at: DateTime<Utc>) -> String {
    format!("{:020}", unix_nanos(at))
}

fn decode(raw: &IVec) -> Result<DeadLetterEntry, DeadLetterError> {
    Ok(serde_json::from_slice(raw)?)
}
