//! # Mint Escrow Contract
//!
//! The authoritative intent ledger. A depositor pledges the deposit asset
//! against a payment reference; once the off-system payment clears, a
//! privileged executor settles the intent by issuing the market's
//! destination asset, or refunds the pledge.
//!
//! ```text
//!             submit_intent
//!   (none) ──────────────────► Pending ──execute_mint──► Executed
//!                                 │    (compliant, within daily cap)
//!                                 └──refund_intent────► Refunded
//! ```
//!
//! ## Atomicity
//!
//! There is no block executor serializing calls for us, so the ledger does
//! it explicitly:
//!
//! - **Submit** holds the payment-reference entry and the intent-id entry
//!   while it debits escrow, so the debit and the record land together or
//!   not at all, and a reference is consumed at most once.
//! - **Execute / refund** hold the intent's own mutex across the whole
//!   check-then-mutate sequence. Two settlements of the same id serialize;
//!   the loser sees `AlreadyExecuted`.
//! - **Daily cap** checks and increments happen under the day bucket's map
//!   entry, so two intents racing near the cap cannot both fit.
//!
//! Unrelated intents and unrelated day buckets never share a lock.
//!
//! ## Durability
//!
//! Every change is written through a [`LedgerJournal`] before it becomes
//! visible in memory: submit commits reference and intent together, execute
//! commits the intent and its day bucket together. [`MintEscrow::with_journal`]
//! replays the journal on startup, re-escrowing deposits of open and
//! executed intents and rebuilding local destination balances.
//!
//! ## Ordering
//!
//! The status flip and the accumulator increment are committed *before*
//! destination issuance is invoked. A re-entrant or repeated call therefore
//! finds the intent already `Executed`. If issuance itself fails, both are
//! reverted while the intent lock is still held and the caller gets a
//! transient error.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mintbridge_protocol::clock::{Clock, SystemClock};
use mintbridge_protocol::config::{BridgeConfig, SECONDS_PER_DAY};
use mintbridge_protocol::ledger::{
    is_well_formed_intent_id, Intent, IntentId, IntentStatus, LedgerClient, LedgerError,
    SubmitIntent,
};
use mintbridge_protocol::storage::{JournalError, LedgerJournal, VolatileJournal};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::access::{AccessControl, Credential, Role};
use crate::asset_ledger::{AssetError, AssetLedger, DestinationIssuer};
use crate::compliance::{ComplianceOracle, OracleError};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Bounds and market table the ledger enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowSettings {
    pub min_amount: u128,
    pub max_amount: u128,
    /// Maximum destination issuance per UTC day, across all markets.
    pub daily_limit: u128,
    /// Market code to destination asset symbol.
    pub markets: BTreeMap<String, String>,
}

impl From<&BridgeConfig> for EscrowSettings {
    fn from(cfg: &BridgeConfig) -> Self {
        Self {
            min_amount: cfg.limits.min_amount,
            max_amount: cfg.limits.max_amount,
            daily_limit: cfg.limits.daily_limit,
            markets: cfg.markets.clone(),
        }
    }
}

/// The UTC day a timestamp falls in: whole days since the unix epoch.
pub fn day_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(SECONDS_PER_DAY)
}

/// Why a journal could not be replayed into a fresh ledger.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("failed to read ledger journal: {0}")]
    Journal(#[from] JournalError),

    #[error("cannot replay intent {id}: {reason}")]
    Replay { id: IntentId, reason: String },
}

fn journal_failure(err: JournalError) -> LedgerError {
    LedgerError::Transient(format!("ledger journal: {err}"))
}

// ---------------------------------------------------------------------------
// MintEscrow
// ---------------------------------------------------------------------------

/// The intent ledger.
pub struct MintEscrow {
    settings: EscrowSettings,
    access: Arc<AccessControl>,
    oracle: Arc<dyn ComplianceOracle>,
    assets: Arc<AssetLedger>,
    issuer: Arc<dyn DestinationIssuer>,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn LedgerJournal>,
    intents: DashMap<IntentId, Arc<Mutex<Intent>>>,
    /// Consumed payment references, mapped to the intent that consumed them.
    references: DashMap<String, IntentId>,
    /// Day bucket to amount issued in that bucket.
    issued: DashMap<i64, u128>,
    sequence: AtomicU64,
}

impl MintEscrow {
    /// Creates a ledger that issues through `assets` itself.
    pub fn new(
        settings: EscrowSettings,
        access: Arc<AccessControl>,
        oracle: Arc<dyn ComplianceOracle>,
        assets: Arc<AssetLedger>,
    ) -> Self {
        let issuer: Arc<dyn DestinationIssuer> = assets.clone();
        Self {
            settings,
            access,
            oracle,
            assets,
            issuer,
            clock: Arc::new(SystemClock),
            journal: Arc::new(VolatileJournal),
            intents: DashMap::new(),
            references: DashMap::new(),
            issued: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Routes destination issuance somewhere other than the asset ledger.
    pub fn with_issuer(mut self, issuer: Arc<dyn DestinationIssuer>) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attaches durable storage and replays what it already holds. Call
    /// once, after seeding balances and before serving requests.
    ///
    /// Replay never calls the destination issuer; executed intents are
    /// credited to the local asset ledger only.
    pub fn with_journal(mut self, journal: Arc<dyn LedgerJournal>) -> Result<Self, RestoreError> {
        let snapshot = journal.load()?;
        for intent in snapshot.intents {
            self.replay(&intent)?;
            self.intents
                .insert(intent.id.clone(), Arc::new(Mutex::new(intent)));
        }
        for (reference, id) in snapshot.references {
            self.references.insert(reference, id);
        }
        for (bucket, issued) in snapshot.buckets {
            self.issued.insert(bucket, issued);
        }
        self.sequence = AtomicU64::new(self.intents.len() as u64);
        self.journal = journal;
        if !self.intents.is_empty() {
            info!(
                intents = self.intents.len(),
                buckets = self.issued.len(),
                "ledger restored from journal"
            );
        }
        Ok(self)
    }

    fn replay(&self, intent: &Intent) -> Result<(), RestoreError> {
        let failed = |reason: String| RestoreError::Replay {
            id: intent.id.clone(),
            reason,
        };
        if intent.status == IntentStatus::Refunded {
            return Ok(());
        }
        self.assets
            .escrow_deposit(&intent.depositor, intent.amount)
            .map_err(|e| failed(e.to_string()))?;
        if intent.status == IntentStatus::Executed {
            let destination = self
                .settings
                .markets
                .get(&intent.market_code)
                .ok_or_else(|| failed(format!("unknown market {}", intent.market_code)))?;
            self.assets
                .issue(destination, &intent.depositor, intent.amount)
                .map_err(|e| failed(e.to_string()))?;
        }
        Ok(())
    }

    pub fn settings(&self) -> &EscrowSettings {
        &self.settings
    }

    pub fn assets(&self) -> &Arc<AssetLedger> {
        &self.assets
    }

    // -- Submission ---------------------------------------------------------

    /// Escrows the deposit and records a `Pending` intent.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] if `amount` is outside the bounds.
    /// - [`LedgerError::InvalidMarket`] if the market has no destination asset.
    /// - [`LedgerError::DuplicatePaymentReference`] if the reference was used.
    /// - [`LedgerError::AlreadyExists`] if the derived id is already recorded.
    /// - [`LedgerError::InsufficientFunds`] if the depositor cannot cover it.
    pub fn submit_intent(&self, request: SubmitIntent) -> Result<IntentId, LedgerError> {
        let s = &self.settings;
        if request.amount < s.min_amount || request.amount > s.max_amount {
            return Err(LedgerError::InvalidAmount {
                amount: request.amount,
                min: s.min_amount,
                max: s.max_amount,
            });
        }
        if !s.markets.contains_key(&request.market_code) {
            return Err(LedgerError::InvalidMarket(request.market_code));
        }

        let reference_slot = match self.references.entry(request.payment_reference.clone()) {
            Entry::Occupied(_) => {
                return Err(LedgerError::DuplicatePaymentReference(
                    request.payment_reference,
                ))
            }
            Entry::Vacant(slot) => slot,
        };

        let id = request.intent_id();
        let intent_slot = match self.intents.entry(id.clone()) {
            Entry::Occupied(_) => return Err(LedgerError::AlreadyExists(id)),
            Entry::Vacant(slot) => slot,
        };

        self.assets
            .escrow_deposit(&request.depositor, request.amount)
            .map_err(|e| match e {
                AssetError::InsufficientBalance {
                    balance, required, ..
                } => LedgerError::InsufficientFunds { balance, required },
                other => LedgerError::Transient(other.to_string()),
            })?;

        let intent = Intent {
            id: id.clone(),
            depositor: request.depositor,
            amount: request.amount,
            market_code: request.market_code,
            payment_reference: request.payment_reference,
            created_at: self.clock.now(),
            status: IntentStatus::Pending,
            settled_at: None,
            settlement_ref: None,
            refund_reason: None,
        };
        if let Err(e) = self.journal.record_submission(&intent) {
            if let Err(undo) = self.assets.release_escrow(&intent.depositor, intent.amount) {
                error!(intent_id = %id, error = %undo, "could not return escrow after journal failure");
            }
            return Err(match e {
                JournalError::ReferenceConsumed(reference) => {
                    LedgerError::DuplicatePaymentReference(reference)
                }
                other => journal_failure(other),
            });
        }
        info!(
            intent_id = %id,
            depositor = %intent.depositor,
            amount = %intent.amount,
            market = %intent.market_code,
            "intent submitted"
        );
        intent_slot.insert(Arc::new(Mutex::new(intent)));
        reference_slot.insert(id.clone());
        Ok(id)
    }

    // -- Settlement ---------------------------------------------------------

    /// Compliance- and cap-gated issuance of the destination asset.
    ///
    /// Requires [`Role::Executor`]. On `NotCompliant` or
    /// `DailyLimitExceeded` nothing is mutated.
    pub fn execute_mint(&self, caller: &Credential, intent_id: &str) -> Result<String, LedgerError> {
        self.authorize(caller)?;
        let handle = self.lookup(intent_id)?;
        let mut intent = handle.lock();

        if intent.status != IntentStatus::Pending {
            return Err(LedgerError::AlreadyExecuted {
                id: intent.id.clone(),
                status: intent.status,
            });
        }

        match self.oracle.is_compliant(&intent.depositor) {
            Ok(true) => {}
            Ok(false) => {
                debug!(intent_id, depositor = %intent.depositor, "depositor not compliant");
                return Err(LedgerError::NotCompliant(intent.depositor.clone()));
            }
            Err(OracleError::Unavailable(reason)) => return Err(LedgerError::Transient(reason)),
        }

        let destination = self
            .settings
            .markets
            .get(&intent.market_code)
            .cloned()
            .ok_or_else(|| LedgerError::InvalidMarket(intent.market_code.clone()))?;

        let now = self.clock.now();
        let bucket = day_bucket(now);
        let settlement_ref = self.settlement_ref("execute", intent_id);
        {
            let mut issued = self.issued.entry(bucket).or_insert(0);
            let available = self.settings.daily_limit.saturating_sub(*issued);
            if intent.amount > available {
                warn!(intent_id, bucket, requested = %intent.amount, available = %available, "daily limit exceeded");
                return Err(LedgerError::DailyLimitExceeded {
                    requested: intent.amount,
                    available,
                });
            }
            // Effects before interactions: commit status and accumulator
            // together, then call out.
            let total = *issued + intent.amount;
            let mut executed = intent.clone();
            executed.status = IntentStatus::Executed;
            executed.settled_at = Some(now);
            executed.settlement_ref = Some(settlement_ref.clone());
            self.journal
                .record_settlement(&executed, bucket, total)
                .map_err(journal_failure)?;
            *issued = total;
            *intent = executed;
        }

        if let Err(e) = self.issuer.issue(&destination, &intent.depositor, intent.amount) {
            let mut issued = self.issued.entry(bucket).or_insert(0);
            let restored = issued.saturating_sub(intent.amount);
            let mut pending = intent.clone();
            pending.status = IntentStatus::Pending;
            pending.settled_at = None;
            pending.settlement_ref = None;
            if let Err(journal_err) = self.journal.record_settlement(&pending, bucket, restored) {
                // Memory stays in step with the journal, which still says
                // executed; replay credits the destination on restart.
                error!(intent_id, error = %e, journal_error = %journal_err, "issuance failed and could not be reverted");
                return Err(LedgerError::Transient(e.to_string()));
            }
            *issued = restored;
            *intent = pending;
            warn!(intent_id, error = %e, "issuance failed, execution reverted");
            return Err(LedgerError::Transient(e.to_string()));
        }

        info!(
            intent_id,
            depositor = %intent.depositor,
            amount = %intent.amount,
            asset = %destination,
            bucket,
            %settlement_ref,
            "intent executed"
        );
        Ok(settlement_ref)
    }

    /// Returns the escrowed deposit of a `Pending` intent to its depositor.
    ///
    /// Requires [`Role::Executor`].
    pub fn refund_intent(
        &self,
        caller: &Credential,
        intent_id: &str,
        reason: &str,
    ) -> Result<String, LedgerError> {
        self.authorize(caller)?;
        let handle = self.lookup(intent_id)?;
        let mut intent = handle.lock();

        if intent.status != IntentStatus::Pending {
            return Err(LedgerError::AlreadyExecuted {
                id: intent.id.clone(),
                status: intent.status,
            });
        }

        self.assets
            .release_escrow(&intent.depositor, intent.amount)
            .map_err(|e| LedgerError::Transient(e.to_string()))?;

        let settlement_ref = self.settlement_ref("refund", intent_id);
        let mut refunded = intent.clone();
        refunded.status = IntentStatus::Refunded;
        refunded.settled_at = Some(self.clock.now());
        refunded.refund_reason = Some(reason.to_string());
        refunded.settlement_ref = Some(settlement_ref.clone());
        if let Err(e) = self.journal.record_intent(&refunded) {
            if let Err(undo) = self.assets.escrow_deposit(&intent.depositor, intent.amount) {
                error!(intent_id, error = %undo, "could not re-escrow after journal failure");
            }
            return Err(journal_failure(e));
        }
        *intent = refunded;
        info!(intent_id, reason, %settlement_ref, "intent refunded");
        Ok(settlement_ref)
    }

    // -- Queries ------------------------------------------------------------

    pub fn get_intent(&self, intent_id: &str) -> Option<Intent> {
        let handle = self.intents.get(intent_id)?.value().clone();
        let intent = handle.lock().clone();
        Some(intent)
    }

    pub fn get_status(&self, intent_id: &str) -> Option<IntentStatus> {
        let handle = self.intents.get(intent_id)?.value().clone();
        let status = handle.lock().status;
        Some(status)
    }

    /// Amount issued in `bucket` so far.
    pub fn issued_in(&self, bucket: i64) -> u128 {
        self.issued.get(&bucket).map(|v| *v).unwrap_or(0)
    }

    /// Remaining issuance capacity for the current day.
    pub fn available_today(&self) -> u128 {
        let bucket = day_bucket(self.clock.now());
        self.settings
            .daily_limit
            .saturating_sub(self.issued_in(bucket))
    }

    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }

    /// Drops accumulator buckets older than `retention_days` before today.
    /// Caps are only ever checked against the current bucket.
    pub fn prune_buckets(&self, retention_days: i64) -> usize {
        let cutoff = day_bucket(self.clock.now()) - retention_days.max(0);
        if let Err(e) = self.journal.prune_buckets(cutoff) {
            warn!(error = %e, "failed to prune journaled day buckets");
        }
        let before = self.issued.len();
        self.issued.retain(|bucket, _| *bucket >= cutoff);
        before - self.issued.len()
    }

    // -- Internals ----------------------------------------------------------

    fn authorize(&self, caller: &Credential) -> Result<(), LedgerError> {
        self.access
            .require(caller, Role::Executor)
            .map_err(|_| LedgerError::Unauthorized(caller.principal().to_string()))
    }

    fn lookup(&self, intent_id: &str) -> Result<Arc<Mutex<Intent>>, LedgerError> {
        if !is_well_formed_intent_id(intent_id) {
            return Err(LedgerError::InvalidIntentId(intent_id.to_string()));
        }
        self.intents
            .get(intent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LedgerError::NotFound(intent_id.to_string()))
    }

    fn settlement_ref(&self, operation: &str, intent_id: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update(intent_id.as_bytes());
        hasher.update(seq.to_be_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }
}

// ---------------------------------------------------------------------------
// LedgerClient adapter
// ---------------------------------------------------------------------------

/// Drives a [`MintEscrow`] on behalf of one executor credential. This is
/// what the node hands to the settlement executor and HTTP handlers.
#[derive(Clone)]
pub struct EscrowClient {
    escrow: Arc<MintEscrow>,
    credential: Credential,
}

impl EscrowClient {
    pub fn new(escrow: Arc<MintEscrow>, credential: Credential) -> Self {
        Self { escrow, credential }
    }

    pub fn escrow(&self) -> &Arc<MintEscrow> {
        &self.escrow
    }
}

#[async_trait]
impl LedgerClient for EscrowClient {
    async fn submit_intent(&self, request: SubmitIntent) -> Result<IntentId, LedgerError> {
        self.escrow.submit_intent(request)
    }

    async fn execute_mint(&self, intent_id: &str) -> Result<String, LedgerError> {
        self.escrow.execute_mint(&self.credential, intent_id)
    }

    async fn refund_intent(&self, intent_id: &str, reason: &str) -> Result<String, LedgerError> {
        self.escrow.refund_intent(&self.credential, intent_id, reason)
    }

    async fn get_intent(&self, intent_id: &str) -> Option<Intent> {
        self.escrow.get_intent(intent_id)
    }

    async fn get_status(&self, intent_id: &str) -> Option<IntentStatus> {
        self.escrow.get_status(intent_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
