//! # Bridge Configuration & Constants
//!
//! Every tunable of the settlement bridge lives here: the compile-time
//! defaults, the header names both signed channels speak, and the
//! [`BridgeConfig`] tree that an operator loads from a JSON file at startup.
//!
//! Secrets and limits are configuration, not constants. Nothing in this
//! module should ever hardcode a key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Service Defaults
// ---------------------------------------------------------------------------

/// Protocol version reported by the node and the health endpoint.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Default port for the HTTP API.
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Default port for the Prometheus scrape endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 3001;

/// Seconds in one issuance day bucket. The daily cap is evaluated against
/// `unix_seconds / SECONDS_PER_DAY`, a fixed calendar-day cutover in UTC.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Default tolerated distance between a request timestamp and our clock.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Default lifetime of a cached idempotent response.
pub const DEFAULT_IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// How long an in-flight claim marker blocks other callers with the same key.
/// Must comfortably exceed the notification deadline, or a slow retry loop
/// would lose its claim while still running.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(120);

/// Upper bound on one settlement notification, retries included.
pub const DEFAULT_NOTIFICATION_DEADLINE: Duration = Duration::from_secs(60);

/// Largest request body the signature layer will buffer.
pub const MAX_SIGNED_BODY_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Signature header on the intent-submission channel.
pub const INTENT_SIGNATURE_HEADER: &str = "x-request-signature";

/// Timestamp header on the intent-submission channel.
pub const INTENT_TIMESTAMP_HEADER: &str = "x-request-timestamp";

/// Signature header on the settlement-notification channel.
pub const SETTLEMENT_SIGNATURE_HEADER: &str = "x-settlement-signature";

/// Timestamp header on the settlement-notification channel.
pub const SETTLEMENT_TIMESTAMP_HEADER: &str = "x-settlement-timestamp";

/// Caller-supplied deduplication token on the submission channel.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Correlation id assigned to every request that arrives without one.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Namespace tag for idempotency keys manufactured from settlement
/// notifications. Keeps a payment reference from colliding with a
/// caller-supplied submission key of the same spelling.
pub const SETTLEMENT_KEY_PREFIX: &str = "settlement:";

// ---------------------------------------------------------------------------
// Retry Defaults
// ---------------------------------------------------------------------------

/// Attempts per notification before the payload is dead-lettered.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 6;

/// Wait after the first failed attempt.
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 750;

/// Ceiling on any single wait.
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 10_000;

/// Growth factor between consecutive waits.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// Symmetric jitter ratio applied to each computed wait (0.1 = ±10%).
pub const DEFAULT_RETRY_JITTER: f64 = 0.1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Problems loading or validating a [`BridgeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Configuration Tree
// ---------------------------------------------------------------------------

/// Top-level configuration for a bridge node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub service: ServiceConfig,
    pub secrets: SecretsConfig,
    pub limits: LimitsConfig,
    pub compliance: ComplianceConfig,
    pub retry: RetryConfig,
    /// Market code -> destination asset symbol. The closed set of asset
    /// classes the ledger is willing to issue.
    pub markets: BTreeMap<String, String>,
    /// Devnet bootstrap data. Empty in any real deployment.
    pub seed: SeedConfig,
}

/// Process-level knobs: ports and time windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub clock_skew_secs: u64,
    /// Separate skew window for the settlement channel. Falls back to
    /// `clock_skew_secs` when unset.
    pub settlement_clock_skew_secs: Option<u64>,
    pub idempotency_window_secs: u64,
    pub claim_ttl_secs: u64,
    pub notification_deadline_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            clock_skew_secs: DEFAULT_CLOCK_SKEW.as_secs(),
            settlement_clock_skew_secs: None,
            idempotency_window_secs: DEFAULT_IDEMPOTENCY_WINDOW.as_secs(),
            claim_ttl_secs: DEFAULT_CLAIM_TTL.as_secs(),
            notification_deadline_secs: DEFAULT_NOTIFICATION_DEADLINE.as_secs(),
        }
    }
}

impl ServiceConfig {
    pub fn intent_clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }

    pub fn settlement_clock_skew(&self) -> Duration {
        Duration::from_secs(
            self.settlement_clock_skew_secs
                .unwrap_or(self.clock_skew_secs),
        )
    }

    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_window_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn notification_deadline(&self) -> Duration {
        Duration::from_secs(self.notification_deadline_secs)
    }
}

/// Shared secrets for the two signed channels. They must differ: a leaked
/// submission secret must not let anyone forge settlement notifications.
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecretsConfig {
    pub intent_secret: String,
    pub settlement_secret: String,
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("intent_secret", &"<redacted>")
            .field("settlement_secret", &"<redacted>")
            .finish()
    }
}

/// Amount bounds, all in the deposit asset's smallest unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_amount: u128,
    pub max_amount: u128,
    pub daily_limit: u128,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        // 1 unit .. 10k units per intent, 100k units per day, 18 decimals.
        const UNIT: u128 = 1_000_000_000_000_000_000;
        Self {
            min_amount: UNIT,
            max_amount: 10_000 * UNIT,
            daily_limit: 100_000 * UNIT,
        }
    }
}

/// Policy the compliance oracle evaluates records against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComplianceConfig {
    pub max_risk_score: u8,
    pub require_attestation: bool,
    pub min_attestation_age_secs: u64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            max_risk_score: 83,
            require_attestation: true,
            min_attestation_age_secs: 0,
        }
    }
}

/// Settlement retry schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

/// Devnet bootstrap data: deposit-asset balances and compliance records.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SeedConfig {
    pub balances: BTreeMap<String, u128>,
    pub compliance: BTreeMap<String, SeedComplianceRecord>,
}

/// One seeded compliance record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SeedComplianceRecord {
    pub risk_score: u8,
    pub attestation: Option<String>,
    /// Age of the attestation at startup, in seconds.
    pub attestation_age_secs: u64,
}

impl BridgeConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let raw = std::fs::read(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path_str.clone(),
            source,
        })?;
        let config: BridgeConfig =
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
                path: path_str,
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the bridge cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.secrets.intent_secret.is_empty() || self.secrets.settlement_secret.is_empty() {
            return invalid("both channel secrets must be set");
        }
        if self.secrets.intent_secret == self.secrets.settlement_secret {
            return invalid("intent and settlement channels must use distinct secrets");
        }
        if self.limits.min_amount == 0 || self.limits.min_amount > self.limits.max_amount {
            return invalid("limits require 0 < min_amount <= max_amount");
        }
        if self.limits.daily_limit == 0 {
            return invalid("daily_limit must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1");
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be in [0, 1)");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return invalid("retry.initial_backoff_ms exceeds retry.max_backoff_ms");
        }
        if self.markets.is_empty() {
            return invalid("at least one market must be configured");
        }
        if self.service.claim_ttl_secs <= self.service.notification_deadline_secs {
            return invalid("service.claim_ttl_secs must exceed notification_deadline_secs");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BridgeConfig {
        let mut cfg = BridgeConfig::default();
        cfg.secrets.intent_secret = "intent-secret".into();
        cfg.secrets.settlement_secret = "settlement-secret".into();
        cfg.markets.insert("KES".into(), "KESt".into());
        cfg
    }

    #[test]
    fn defaults_validate_once_secrets_and_markets_exist() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(BridgeConfig::default().validate().is_err());
    }

    #[test]
    fn shared_secret_across_channels_is_rejected() {
        let mut cfg = valid_config();
        cfg.secrets.settlement_secret = cfg.secrets.intent_secret.clone();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("distinct"));
    }

    #[test]
    fn inverted_amount_bounds_are_rejected() {
        let mut cfg = valid_config();
        cfg.limits.min_amount = 10;
        cfg.limits.max_amount = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn jitter_out_of_range_is_rejected() {
        let mut cfg = valid_config();
        cfg.retry.jitter = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn settlement_skew_falls_back_to_intent_skew() {
        let mut svc = ServiceConfig::default();
        assert_eq!(svc.settlement_clock_skew(), svc.intent_clock_skew());
        svc.settlement_clock_skew_secs = Some(5);
        assert_eq!(svc.settlement_clock_skew(), Duration::from_secs(5));
    }

    #[test]
    fn load_parses_partial_json_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(
            &path,
            r#"{
                "secrets": { "intent_secret": "a", "settlement_secret": "b" },
                "markets": { "KES": "KESt" },
                "retry": { "max_attempts": 3 },
                "seed": { "balances": { "0xabc": 5000000000000000000 } }
            }"#,
        )
        .unwrap();

        let cfg = BridgeConfig::load(&path).unwrap();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.initial_backoff_ms, DEFAULT_RETRY_INITIAL_BACKOFF_MS);
        assert_eq!(cfg.service.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(cfg.seed.balances["0xabc"], 5_000_000_000_000_000_000);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = BridgeConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = valid_config();
        let rendered = format!("{:?}", cfg.secrets);
        assert!(!rendered.contains("intent-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn settlement_prefix_is_namespaced() {
        assert!(SETTLEMENT_KEY_PREFIX.ends_with(':'));
    }
}
