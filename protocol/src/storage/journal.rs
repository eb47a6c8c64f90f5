//! # Ledger Journal
//!
//! Durable record of the intent ledger: every intent, every consumed payment
//! reference, and the issued total of each UTC day bucket. The ledger keeps
//! its working set in memory and writes through here; on startup it replays
//! a [`LedgerSnapshot`] to rebuild that working set.
//!
//! Multi-record changes commit in one sled transaction across trees, so a
//! crash never leaves a reference consumed without its intent, or an
//! intent `Executed` without its day bucket charged.

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use sled::Tree;

use crate::ledger::Intent;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("journal encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The reference is already recorded against another intent.
    #[error("payment reference {0} already consumed")]
    ReferenceConsumed(String),

    #[error("corrupt journal entry: {0}")]
    Corrupt(String),
}

pub type JournalResult<T> = Result<T, JournalError>;

fn from_transaction(err: TransactionError<JournalError>) -> JournalError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => JournalError::Sled(e),
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Everything needed to rebuild the ledger's working set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Ordered by creation time, then id.
    pub intents: Vec<Intent>,
    /// `(payment_reference, intent_id)`.
    pub references: Vec<(String, String)>,
    /// `(day_bucket, issued)`.
    pub buckets: Vec<(i64, u128)>,
}

impl LedgerSnapshot {
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty() && self.references.is_empty() && self.buckets.is_empty()
    }
}

// ---------------------------------------------------------------------------
// LedgerJournal
// ---------------------------------------------------------------------------

/// Write-through persistence for the intent ledger.
pub trait LedgerJournal: Send + Sync {
    /// Reads back everything recorded so far.
    fn load(&self) -> JournalResult<LedgerSnapshot>;

    /// Consumes the intent's payment reference and records the intent, both
    /// or neither. Fails with [`JournalError::ReferenceConsumed`] if the
    /// reference is already recorded.
    fn record_submission(&self, intent: &Intent) -> JournalResult<()>;

    /// Records an intent together with the issued total of `bucket`.
    fn record_settlement(&self, intent: &Intent, bucket: i64, issued: u128) -> JournalResult<()>;

    /// Overwrites one intent record.
    fn record_intent(&self, intent: &Intent) -> JournalResult<()>;

    /// Drops bucket totals older than `cutoff`. Returns how many went.
    fn prune_buckets(&self, cutoff: i64) -> JournalResult<usize>;
}

/// Keeps nothing. The ledger's default, for tests and throwaway instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolatileJournal;

impl LedgerJournal for VolatileJournal {
    fn load(&self) -> JournalResult<LedgerSnapshot> {
        Ok(LedgerSnapshot::default())
    }

    fn record_submission(&self, _: &Intent) -> JournalResult<()> {
        Ok(())
    }

    fn record_settlement(&self, _: &Intent, _: i64, _: u128) -> JournalResult<()> {
        Ok(())
    }

    fn record_intent(&self, _: &Intent) -> JournalResult<()> {
        Ok(())
    }

    fn prune_buckets(&self, _: i64) -> JournalResult<usize> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// SledLedgerJournal
// ---------------------------------------------------------------------------

/// Journal over three sled trees of a [`BridgeDb`](super::BridgeDb).
#[derive(Debug, Clone)]
pub struct SledLedgerJournal {
    intents: Tree,
    references: Tree,
    buckets: Tree,
}

impl SledLedgerJournal {
    pub fn new(intents: Tree, references: Tree, buckets: Tree) -> Self {
        Self {
            intents,
            references,
            buckets,
        }
    }
}

impl LedgerJournal for SledLedgerJournal {
    fn load(&self) -> JournalResult<LedgerSnapshot> {
        let mut intents = Vec::with_capacity(self.intents.len());
        for item in self.intents.iter() {
            let (_, raw) = item?;
            intents.push(serde_json::from_slice::<Intent>(&raw)?);
        }
        intents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut references = Vec::with_capacity(self.references.len());
        for item in self.references.iter() {
            let (key, raw) = item?;
            references.push((utf8(&key)?, utf8(&raw)?));
        }

        let mut buckets = Vec::with_capacity(self.buckets.len());
        for item in self.buckets.iter() {
            let (key, raw) = item?;
            buckets.push((decode_bucket(&key)?, decode_amount(&raw)?));
        }

        Ok(LedgerSnapshot {
            intents,
            references,
            buckets,
        })
    }

    fn record_submission(&self, intent: &Intent) -> JournalResult<()> {
        let value = serde_json::to_vec(intent)?;
        (&self.references, &self.intents)
            .transaction(|(references, intents)| -> ConflictableTransactionResult<(), JournalError> {
                let reference = intent.payment_reference.as_bytes();
                if references.get(reference)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        JournalError::ReferenceConsumed(intent.payment_reference.clone()),
                    ));
                }
                references.insert(reference, intent.id.as_bytes())?;
                intents.insert(intent.id.as_bytes(), value.as_slice())?;
                Ok(())
            })
            .map_err(from_transaction)
    }

    fn record_settlement(&self, intent: &Intent, bucket: i64, issued: u128) -> JournalResult<()> {
        let value = serde_json::to_vec(intent)?;
        (&self.intents, &self.buckets)
            .transaction(|(intents, buckets)| -> ConflictableTransactionResult<(), JournalError> {
                intents.insert(intent.id.as_bytes(), value.as_slice())?;
                buckets.insert(&bucket.to_be_bytes()[..], &issued.to_be_bytes()[..])?;
                Ok(())
            })
            .map_err(from_transaction)
    }

    fn record_intent(&self, intent: &Intent) -> JournalResult<()> {
        self.intents
            .insert(intent.id.as_bytes(), serde_json::to_vec(intent)?)?;
        Ok(())
    }

    fn prune_buckets(&self, cutoff: i64) -> JournalResult<usize> {
        let mut removed = 0;
        for item in self.buckets.iter() {
            let (key, _) = item?;
            if decode_bucket(&key)? < cutoff {
                self.buckets.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn utf8(raw: &[u8]) -> JournalResult<String> {
    String::from_utf8(raw.to_vec()).map_err(|e| JournalError::Corrupt(e.to_string()))
}

fn decode_bucket(raw: &[u8]) -> JournalResult<i64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| JournalError::Corrupt(format!("bucket key of {} bytes", raw.len())))?;
    Ok(i64::from_be_bytes(bytes))
}

fn decode_amount(raw: &[u8]) -> JournalResult<u128> {
    let bytes: [u8; 16] = raw
        .try_into()
        .map_err(|_| JournalError::Corrupt(format!("bucket total of {} bytes", raw.len())))?;
    Ok(u128::from_be_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::IntentStatus;
    use crate::storage::BridgeDb;
    use chrono::{DateTime, Utc};

    fn intent(reference: &str, created: i64) -> Intent {
        Intent {
            id: format!("0x{:064x}", created),
            depositor: "0xalice".into(),
            amount: 5,
            market_code: "KES".into(),
            payment_reference: reference.into(),
            created_at: DateTime::<Utc>::from_timestamp(created, 0).unwrap(),
            status: IntentStatus::Pending,
            settled_at: None,
            settlement_ref: None,
            refund_reason: None,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let later = intent("ref-2", 1_700_000_100);
        let mut executed = intent("ref-1", 1_700_000_000);
        {
            let db = BridgeDb::open(dir.path()).unwrap();
            let journal = db.ledger_journal();
            journal.record_submission(&later).unwrap();
            journal.record_submission(&executed).unwrap();
            executed.status = IntentStatus::Executed;
            executed.settlement_ref = Some("0xsettled".into());
            journal.record_settlement(&executed, 19_675, 5).unwrap();
            db.flush().unwrap();
        }

        let db = BridgeDb::open(dir.path()).unwrap();
        let snapshot = db.ledger_journal().load().unwrap();
        assert_eq!(snapshot.intents, vec![executed.clone(), later.clone()]);
        assert_eq!(snapshot.buckets, vec![(19_675, 5)]);
        assert_eq!(snapshot.references.len(), 2);
        assert!(snapshot
            .references
            .contains(&("ref-1".to_string(), executed.id.clone())));
    }

    #[test]
    fn consumed_reference_aborts_the_whole_submission() {
        let db = BridgeDb::open_temporary().unwrap();
        let journal = db.ledger_journal();
        journal.record_submission(&intent("ref-1", 1)).unwrap();

        let reuse = intent("ref-1", 2);
        assert!(matches!(
            journal.record_submission(&reuse),
            Err(JournalError::ReferenceConsumed(r)) if r == "ref-1"
        ));
        let snapshot = journal.load().unwrap();
        assert_eq!(snapshot.intents.len(), 1);
        assert_ne!(snapshot.intents[0].id, reuse.id);
    }

    #[test]
    fn prune_drops_only_old_buckets() {
        let db = BridgeDb::open_temporary().unwrap();
        let journal = db.ledger_journal();
        let i = intent("ref-1", 1);
        for bucket in [100, 101, 107] {
            journal.record_settlement(&i, bucket, 1).unwrap();
        }
        assert_eq!(journal.prune_buckets(101).unwrap(), 1);
        let buckets: Vec<i64> = journal.load().unwrap().buckets.iter().map(|b| b.0).collect();
        assert_eq!(buckets, vec![101, 107]);
    }

    #[test]
    fn volatile_journal_forgets() {
        let journal = VolatileJournal;
        journal.record_submission(&intent("ref-1", 1)).unwrap();
        assert!(journal.load().unwrap().is_empty());
    }
}
