//! # Compliance Oracle
//!
//! The ledger asks one question before issuing: is this depositor eligible
//! right now? [`ComplianceOracle`] is that question. [`ComplianceRegistry`]
//! is the in-process answer used by the node and the tests: a table of
//! per-depositor records judged against a [`ComplianceConfig`] policy.
//!
//! The ledger never writes compliance data. Records are maintained by
//! operators (or seeded from config on devnets).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mintbridge_protocol::clock::{Clock, SystemClock};
use mintbridge_protocol::config::ComplianceConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The oracle could not produce an answer. Distinct from a `false` answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("compliance oracle unavailable: {0}")]
    Unavailable(String),
}

/// Eligibility check consumed by the escrow ledger. Must be side-effect free.
pub trait ComplianceOracle: Send + Sync {
    /// `Ok(false)` for unknown or ineligible depositors.
    fn is_compliant(&self, depositor: &str) -> Result<bool, OracleError>;
}

/// What the registry knows about one depositor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceRecord {
    /// 0 (clean) to 255.
    pub risk_score: u8,
    /// Attestation reference, if one is on file.
    pub attestation: Option<String>,
    /// When the attestation was issued.
    pub attested_at: DateTime<Utc>,
}

/// Policy-driven compliance table.
pub struct ComplianceRegistry {
    policy: ComplianceConfig,
    records: RwLock<HashMap<String, ComplianceRecord>>,
    clock: Arc<dyn Clock>,
}

impl ComplianceRegistry {
    pub fn new(policy: ComplianceConfig) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: ComplianceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Inserts or replaces the record for `depositor`.
    pub fn set_record(&self, depositor: &str, record: ComplianceRecord) {
        tracing::debug!(depositor, risk_score = record.risk_score, "compliance record updated");
        self.records.write().insert(depositor.to_string(), record);
    }

    pub fn remove_record(&self, depositor: &str) -> Option<ComplianceRecord> {
        self.records.write().remove(depositor)
    }

    pub fn record(&self, depositor: &str) -> Option<ComplianceRecord> {
        self.records.read().get(depositor).cloned()
    }

    pub fn policy(&self) -> &ComplianceConfig {
        &self.policy
    }

    fn judge(&self, record: &ComplianceRecord, now: DateTime<Utc>) -> bool {
        if record.risk_score > self.policy.max_risk_score {
            return false;
        }
        if !self.policy.require_attestation {
            return true;
        }
        let attested = record
            .attestation
            .as_deref()
            .is_some_and(|a| !a.trim().is_empty());
        if !attested {
            return false;
        }
        let age = now.signed_duration_since(record.attested_at).num_seconds();
        age >= 0 && age as u64 >= self.policy.min_attestation_age_secs
    }
}

impl ComplianceOracle for ComplianceRegistry {
    fn is_compliant(&self, depositor: &str) -> Result<bool, OracleError> {
        let now = self.clock.now();
        Ok(self
            .records
            .read()
            .get(depositor)
            .is_some_and(|record| self.judge(record, now)))
    }
}
