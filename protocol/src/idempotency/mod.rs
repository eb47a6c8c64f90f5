//! # Idempotent Intake
//!
//! A durable cache of prior responses keyed by a deduplication token, plus
//! the claim protocol that closes the get-then-save race.
//!
//! ## Key lifecycle
//!
//! ```text
//!            claim()                 save()
//!  absent ───────────► Claimed ───────────────► Completed ──(expires_at)──► absent
//!                        │   release() / claim TTL
//!                        └──────────────────────► absent
//! ```
//!
//! Only one caller can move a key from absent to `Claimed`; that caller alone
//! performs the side-effecting operation. Concurrent callers see
//! [`Claim::InFlight`] and are told to retry, or [`Claim::Completed`] and
//! replay the cached response byte-for-byte.
//!
//! A completed record is immutable until it expires: saving a *different*
//! outcome under a live key is a [`StoreError::Conflict`].

pub mod memory;
pub mod sled_store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryIdempotencyStore;
pub use sled_store::SledIdempotencyStore;

/// A cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status_code: u16,
    pub response_body: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(
        key: impl Into<String>,
        status_code: u16,
        response_body: Vec<u8>,
        created_at: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Self {
        Self {
            key: key.into(),
            status_code,
            response_body,
            created_at,
            expires_at: expiry(created_at, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Two records describe the same outcome if status and body match.
    fn same_outcome(&self, other: &IdempotencyRecord) -> bool {
        self.status_code == other.status_code && self.response_body == other.response_body
    }
}

/// Result of trying to claim a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the key and must either `save` or `release` it.
    Acquired,
    /// Another caller holds a live claim.
    InFlight,
    /// The operation already completed; replay this record.
    Completed(IdempotencyRecord),
}

/// What a key currently maps to. Shared by both backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Slot {
    Claimed { expires_at: DateTime<Utc> },
    Completed(IdempotencyRecord),
}

impl Slot {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self {
            Slot::Claimed { expires_at } => now < *expires_at,
            Slot::Completed(record) => !record.is_expired(now),
        }
    }
}

/// Errors from idempotency backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key '{0}' already holds a different completed outcome")]
    Conflict(String),
}

/// Backend contract. Both implementations share read-after-write and TTL
/// semantics; they differ only in whether records survive a restart.
pub trait IdempotencyStore: Send + Sync {
    /// Returns the completed record for `key`, or `None` if absent, expired,
    /// or merely claimed. Expired records may be purged as a side effect.
    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Stores the completed outcome for `key`, superseding any claim.
    fn save(&self, key: &str, record: IdempotencyRecord) -> Result<(), StoreError>;

    /// Atomically claims `key` for `ttl` unless it is live.
    fn claim(&self, key: &str, ttl: std::time::Duration) -> Result<Claim, StoreError>;

    /// Drops a claim without recording an outcome. Completed records are
    /// left untouched.
    fn release(&self, key: &str) -> Result<(), StoreError>;

    /// Reachability check for health reporting.
    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// `now + ttl`, saturating at the largest representable instant.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
