//! # BridgeDb: Persistent Storage Handle
//!
//! One sled database per node, holding every tree the bridge persists.
//!
//! | Tree           | Key                                   | Value                  |
//! |----------------|---------------------------------------|------------------------|
//! | `idempotency`  | idempotency key (UTF-8)               | `bincode(Slot)`        |
//! | `dead_letters` | `{unix_nanos:020}-{payment_reference}` | `json(DeadLetterEntry)` |
//! | `intents`      | intent id (UTF-8)                     | `json(Intent)`         |
//! | `references`   | payment reference (UTF-8)             | intent id (UTF-8)      |
//! | `day_buckets`  | day bucket (`i64` big-endian)         | issued (`u128` BE)     |
//!
//! The handle only opens trees and hands them to the typed stores; each
//! store owns its own encoding.

use std::path::Path;
use std::sync::Arc;

use sled::{Db, Tree};

use crate::clock::Clock;
use crate::dead_letter::DeadLetterQueue;
use crate::idempotency::SledIdempotencyStore;
use crate::storage::journal::SledLedgerJournal;

const IDEMPOTENCY_TREE: &str = "idempotency";
const DEAD_LETTER_TREE: &str = "dead_letters";
const INTENT_TREE: &str = "intents";
const REFERENCE_TREE: &str = "references";
const DAY_BUCKET_TREE: &str = "day_buckets";

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur while opening or probing the database.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// BridgeDb
// ---------------------------------------------------------------------------

/// Shared sled handle. Cheap to clone; sled trees are internally
/// reference-counted and safe to use from many threads.
#[derive(Debug, Clone)]
pub struct BridgeDb {
    db: Db,
    idempotency: Tree,
    dead_letters: Tree,
    intents: Tree,
    references: Tree,
    day_buckets: Tree,
}

impl BridgeDb {
    /// Open or create a database at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway database removed when the last handle drops.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let idempotency = db.open_tree(IDEMPOTENCY_TREE)?;
        let dead_letters = db.open_tree(DEAD_LETTER_TREE)?;
        let intents = db.open_tree(INTENT_TREE)?;
        let references = db.open_tree(REFERENCE_TREE)?;
        let day_buckets = db.open_tree(DAY_BUCKET_TREE)?;
        Ok(Self {
            db,
            idempotency,
            dead_letters,
            intents,
            references,
            day_buckets,
        })
    }

    pub fn idempotency_store(&self, clock: Arc<dyn Clock>) -> SledIdempotencyStore {
        SledIdempotencyStore::with_clock(self.idempotency.clone(), clock)
    }

    pub fn dead_letter_queue(&self, clock: Arc<dyn Clock>) -> DeadLetterQueue {
        DeadLetterQueue::with_clock(self.dead_letters.clone(), clock)
    }

    pub fn ledger_journal(&self) -> SledLedgerJournal {
        SledLedgerJournal::new(
            self.intents.clone(),
            self.references.clone(),
            self.day_buckets.clone(),
        )
    }

    /// Bytes on disk, as reported by sled.
    pub fn size_on_disk(&self) -> DbResult<u64> {
        Ok(self.db.size_on_disk()?)
    }

    /// Block until every pending write is durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
