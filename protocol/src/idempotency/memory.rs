//! Volatile idempotency store. Same semantics as the sled backend, nothing
//! survives a restart. Used by tests and throwaway devnet nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{expiry, Claim, IdempotencyRecord, IdempotencyStore, Slot, StoreError};
use crate::clock::{Clock, SystemClock};

/// In-memory [`IdempotencyStore`]. A single mutex makes every operation
/// atomic; contention is per-process and brief.
pub struct MemoryIdempotencyStore {
    slots: Mutex<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of keys currently tracked, live or not.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for MemoryIdempotencyStore {
    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Completed(record)) if !record.is_expired(now) => Ok(Some(record.clone())),
            Some(slot) if !slot.is_live(now) => {
                slots.remove(key);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn save(&self, key: &str, record: IdempotencyRecord) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        if let Some(Slot::Completed(existing)) = slots.get(key) {
            if !existing.is_expired(now) && !existing.same_outcome(&record) {
                return Err(StoreError::Conflict(key.to_string()));
            }
        }
        slots.insert(key.to_string(), Slot::Completed(record));
        Ok(())
    }

    fn claim(&self, key: &str, ttl: Duration) -> Result<Claim, StoreError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Completed(record)) if !record.is_expired(now) => {
                Ok(Claim::Completed(record.clone()))
            }
            Some(slot @ Slot::Claimed { .. }) if slot.is_live(now) => Ok(Claim::InFlight),
            _ => {
                slots.insert(
                    key.to_string(),
                    Slot::Claimed {
                        expires_at: expiry(now, ttl),
                    },
                );
                Ok(Claim::Acquired)
            }
        }
    }

    fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Claimed { .. })) {
            slots.remove(key);
        }
        Ok(())
    }
}
