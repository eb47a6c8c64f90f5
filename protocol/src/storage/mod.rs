//! # Storage Module
//!
//! The sled handle shared by the durable idempotency store, the dead letter
//! queue, and the intent ledger's journal.

pub mod db;
pub mod journal;

pub use db::{BridgeDb, DbError};
pub use journal::{
    JournalError, LedgerJournal, LedgerSnapshot, SledLedgerJournal, VolatileJournal,
};
