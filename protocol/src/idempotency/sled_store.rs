//! Durable idempotency store backed by a sled tree.
//!
//! Values are `bincode(Slot)`. Every state change goes through
//! `compare_and_swap`, so concurrent claimers race on the stored bytes and
//! exactly one wins without any process-level lock.

use std::sync::Arc;
use std::time::Duration;

use sled::{IVec, Tree};

use super::{expiry, Claim, IdempotencyRecord, IdempotencyStore, Slot, StoreError};
use crate::clock::{Clock, SystemClock};

/// [`IdempotencyStore`] over a sled tree. Survives restarts.
#[derive(Clone)]
pub struct SledIdempotencyStore {
    tree: Tree,
    clock: Arc<dyn Clock>,
}

impl SledIdempotencyStore {
    pub fn new(tree: Tree) -> Self {
        Self::with_clock(tree, Arc::new(SystemClock))
    }

    pub fn with_clock(tree: Tree, clock: Arc<dyn Clock>) -> Self {
        Self { tree, clock }
    }

    /// Drops every slot that is no longer live. Returns how many went.
    ///
    /// Reads already treat expired slots as absent; this only reclaims space.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut purged = 0;
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            if decode(&value)?.is_live(now) {
                continue;
            }
            if self.tree.compare_and_swap(&key, Some(&value), None::<IVec>)?.is_ok() {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::debug!(purged, "purged expired idempotency slots");
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl IdempotencyStore for SledIdempotencyStore {
    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let now = self.clock.now();
        let Some(raw) = self.tree.get(key)? else {
            return Ok(None);
        };
        let slot = decode(&raw)?;
        if !slot.is_live(now) {
            // Lazy purge. Losing the race to a fresh claim is fine.
            let _ = self.tree.compare_and_swap(key, Some(&raw), None::<IVec>)?;
            return Ok(None);
        }
        match slot {
            Slot::Completed(record) => Ok(Some(record)),
            Slot::Claimed { .. } => Ok(None),
        }
    }

    fn save(&self, key: &str, record: IdempotencyRecord) -> Result<(), StoreError> {
        let encoded = encode(&Slot::Completed(record.clone()))?;
        loop {
            let now = self.clock.now();
            let current = self.tree.get(key)?;
            if let Some(raw) = &current {
                if let Slot::Completed(existing) = decode(raw)? {
                    if !existing.is_expired(now) && !existing.same_outcome(&record) {
                        return Err(StoreError::Conflict(key.to_string()));
                    }
                }
            }
            if self
                .tree
                .compare_and_swap(key, current, Some(encoded.clone()))?
                .is_ok()
            {
                break;
            }
        }
        self.tree.flush()?;
        Ok(())
    }

    fn claim(&self, key: &str, ttl: Duration) -> Result<Claim, StoreError> {
        loop {
            let now = self.clock.now();
            let current = self.tree.get(key)?;
            if let Some(raw) = &current {
                match decode(raw)? {
                    Slot::Completed(record) if !record.is_expired(now) => {
                        return Ok(Claim::Completed(record));
                    }
                    slot @ Slot::Claimed { .. } if slot.is_live(now) => {
                        return Ok(Claim::InFlight);
                    }
                    _ => {}
                }
            }
            let marker = encode(&Slot::Claimed {
                expires_at: expiry(now, ttl),
            })?;
            if self
                .tree
                .compare_and_swap(key, current, Some(marker))?
                .is_ok()
            {
                return Ok(Claim::Acquired);
            }
        }
    }

    fn release(&self, key: &str) -> Result<(), StoreError> {
        loop {
            let Some(raw) = self.tree.get(key)? else {
                return Ok(());
            };
            if matches!(decode(&raw)?, Slot::Completed(_)) {
                return Ok(());
            }
            if self
                .tree
                .compare_and_swap(key, Some(&raw), None::<IVec>)?
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.tree.get(b"")?;
        Ok(())
    }
}

fn encode(slot: &Slot) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(slot).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Slot, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
