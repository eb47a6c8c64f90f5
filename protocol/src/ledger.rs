//! # Intent Ledger Interface
//!
//! Types shared between the authoritative escrow ledger and the service
//! that drives it: the [`Intent`] record, its lifecycle [`IntentStatus`],
//! the enumerated [`LedgerError`] kinds, and the [`LedgerClient`] trait.
//!
//! Errors are enumerated rather than free-form strings so the settlement
//! executor can classify them without parsing messages. A business rejection
//! must never be retried; a transport fault must never be dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// Unique, deterministic intent identifier: `0x` + 64 lowercase hex chars.
pub type IntentId = String;

/// Lifecycle of an intent. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    /// Escrowed, awaiting compliance-gated settlement.
    Pending,
    /// Destination asset issued. Terminal.
    Executed,
    /// Escrow returned to the depositor. Terminal.
    Refunded,
}

impl IntentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, IntentStatus::Pending)
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentStatus::Pending => write!(f, "pending"),
            IntentStatus::Executed => write!(f, "executed"),
            IntentStatus::Refunded => write!(f, "refunded"),
        }
    }
}

/// A deposit-to-issuance request held by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub depositor: String,
    /// Deposit amount in the smallest unit.
    pub amount: u128,
    pub market_code: String,
    pub payment_reference: String,
    pub created_at: DateTime<Utc>,
    pub status: IntentStatus,
    /// Set on the single transition out of `Pending`.
    pub settled_at: Option<DateTime<Utc>>,
    pub settlement_ref: Option<String>,
    pub refund_reason: Option<String>,
}

/// Arguments to [`LedgerClient::submit_intent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitIntent {
    pub depositor: String,
    pub amount: u128,
    pub market_code: String,
    pub payment_reference: String,
}

impl SubmitIntent {
    /// Deterministic id over the four submission inputs.
    ///
    /// Layout: `depositor bytes || amount (32B BE) || market (32B, zero
    /// padded) || reference (32B, zero padded)`, hashed with SHA-256.
    pub fn intent_id(&self) -> IntentId {
        let mut hasher = Sha256::new();
        hasher.update(self.depositor.as_bytes());
        let mut amount = [0u8; 32];
        amount[16..].copy_from_slice(&self.amount.to_be_bytes());
        hasher.update(amount);
        hasher.update(pad32(&self.market_code));
        hasher.update(pad32(&self.payment_reference));
        format!("0x{}", hex::encode(hasher.finalize()))
    }
}

/// Left-aligned, zero-padded 32-byte view of a short string. Longer input
/// is hashed first so distinct long references cannot collide on truncation.
fn pad32(value: &str) -> [u8; 32] {
    let bytes = value.as_bytes();
    if bytes.len() > 32 {
        return Sha256::digest(bytes).into();
    }
    let mut out = [0u8; 32];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// Returns true if `id` has the `0x` + 64 hex shape of an [`IntentId`].
pub fn is_well_formed_intent_id(id: &str) -> bool {
    id.len() == 66
        && id.starts_with("0x")
        && id[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The error taxonomy callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or out-of-bounds input. Never retried.
    Validation,
    /// Duplicate reference/id or a state conflict. Never retried.
    Conflict,
    /// Depositor failed the compliance check. Terminal for this attempt.
    Compliance,
    /// Daily issuance cap exhausted. Terminal for this attempt sequence.
    Capacity,
    /// Caller lacks the role required for the operation.
    Authorization,
    /// Infrastructure fault. The only retryable kind.
    TransientInfra,
}

/// Errors returned by every ledger operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("amount {amount} outside [{min}, {max}]")]
    InvalidAmount { amount: u128, min: u128, max: u128 },

    #[error("market '{0}' has no configured destination asset")]
    InvalidMarket(String),

    #[error("payment reference '{0}' already consumed")]
    DuplicatePaymentReference(String),

    #[error("intent {0} already exists")]
    AlreadyExists(IntentId),

    #[error("intent id '{0}' is malformed")]
    InvalidIntentId(String),

    #[error("intent {0} not found")]
    NotFound(IntentId),

    #[error("intent {id} already settled ({status})")]
    AlreadyExecuted { id: IntentId, status: IntentStatus },

    #[error("depositor {0} is not compliant")]
    NotCompliant(String),

    #[error("daily limit exceeded: requested {requested}, available {available}")]
    DailyLimitExceeded { requested: u128, available: u128 },

    #[error("insufficient deposit balance: has {balance}, needs {required}")]
    InsufficientFunds { balance: u128, required: u128 },

    #[error("caller '{0}' is not authorized for this operation")]
    Unauthorized(String),

    #[error("transient ledger failure: {0}")]
    Transient(String),
}

impl LedgerError {
    /// Maps the error onto the service-level taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount { .. }
            | LedgerError::InvalidMarket(_)
            | LedgerError::InvalidIntentId(_) => ErrorKind::Validation,
            LedgerError::DuplicatePaymentReference(_)
            | LedgerError::AlreadyExists(_)
            | LedgerError::NotFound(_)
            | LedgerError::AlreadyExecuted { .. }
            | LedgerError::InsufficientFunds { .. } => ErrorKind::Conflict,
            LedgerError::NotCompliant(_) => ErrorKind::Compliance,
            LedgerError::DailyLimitExceeded { .. } => ErrorKind::Capacity,
            LedgerError::Unauthorized(_) => ErrorKind::Authorization,
            LedgerError::Transient(_) => ErrorKind::TransientInfra,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientInfra
    }
}

// ---------------------------------------------------------------------------
// Client Trait
// ---------------------------------------------------------------------------

/// The ledger operations the service drives. Implementations must make the
/// compound read-modify-write steps indivisible per intent id.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Escrows `amount` and records a `Pending` intent. Returns its id.
    async fn submit_intent(&self, request: SubmitIntent) -> Result<IntentId, LedgerError>;

    /// Compliance- and cap-gated issuance. Returns a settlement reference.
    async fn execute_mint(&self, intent_id: &str) -> Result<String, LedgerError>;

    /// Returns escrow to the depositor of a `Pending` intent.
    async fn refund_intent(&self, intent_id: &str, reason: &str) -> Result<String, LedgerError>;

    async fn get_intent(&self, intent_id: &str) -> Option<Intent>;

    async fn get_status(&self, intent_id: &str) -> Option<IntentStatus>;

    /// Reachability check for health reporting.
    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}
