//! # Settlement
//!
//! Turns an authenticated, deduplicated settlement notification into a
//! completed `execute_mint`, retrying only infrastructure faults.
//!
//! ```text
//! notification ─► SettlementExecutor ─► LedgerClient::execute_mint
//!                      │    ▲   │
//!                      │    └───┘ TransientInfra: back off, try again
//!                      ├─► Terminal error: surface immediately
//!                      └─► attempts exhausted: DeadLetterSink::append
//! ```

pub mod executor;
pub mod retry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SETTLEMENT_KEY_PREFIX;
use crate::ledger::is_well_formed_intent_id;

pub use executor::{ExecutionError, ExecutionReport, SettlementExecutor};
pub use retry::RetryPolicy;

/// Body of a signed settlement notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementNotification {
    pub intent_id: String,
    pub payment_reference: String,
    pub depositor: String,
    /// Smallest-unit decimal string.
    pub amount: String,
}

/// Why a notification body was refused before reaching the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("intent id '{0}' is malformed")]
    InvalidIntentId(String),

    #[error("amount '{0}' is not a positive integer")]
    InvalidAmount(String),
}

impl SettlementNotification {
    pub fn validate(&self) -> Result<(), NotificationError> {
        for (name, value) in [
            ("intentId", &self.intent_id),
            ("paymentReference", &self.payment_reference),
            ("depositor", &self.depositor),
            ("amount", &self.amount),
        ] {
            if value.trim().is_empty() {
                return Err(NotificationError::MissingField(name));
            }
        }
        if !is_well_formed_intent_id(&self.intent_id) {
            return Err(NotificationError::InvalidIntentId(self.intent_id.clone()));
        }
        self.amount_units()?;
        Ok(())
    }

    pub fn amount_units(&self) -> Result<u128, NotificationError> {
        match self.amount.trim().parse::<u128>() {
            Ok(units) if units > 0 => Ok(units),
            _ => Err(NotificationError::InvalidAmount(self.amount.clone())),
        }
    }

    /// Idempotency key on the settlement channel. The prefix keeps it apart
    /// from caller-chosen keys on the intent channel.
    pub fn idempotency_key(&self) -> String {
        format!("{SETTLEMENT_KEY_PREFIX}{}", self.payment_reference)
    }
}
