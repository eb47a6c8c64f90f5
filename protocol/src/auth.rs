//! # Request Authenticity
//!
//! Every inbound request is signed by its sender with
//! `hex(HMAC-SHA256(secret, timestamp || body))`, where `timestamp` is the
//! raw decimal unix-seconds string carried in a header. The verifier
//! recomputes the MAC over the exact bytes received and compares in constant
//! time, then rejects timestamps that sit too far from our clock in *either*
//! direction.
//!
//! Each signed channel gets its own [`SignatureVerifier`] with its own
//! secret, header names, and skew window. HTTP plumbing (buffering and
//! restoring the body) is the caller's job; this module only sees bytes.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::clock::{Clock, SystemClock};

type HmacSha256 = Hmac<Sha256>;

/// Reasons a request fails authentication. All map to HTTP 401.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing request signature")]
    MissingSignature,

    #[error("missing or malformed request timestamp")]
    MissingTimestamp,

    #[error("stale request timestamp")]
    StaleTimestamp,

    #[error("invalid request signature")]
    InvalidSignature,
}

/// Validates signature and freshness for one channel.
#[derive(Clone)]
pub struct SignatureVerifier {
    channel: &'static str,
    secret: Vec<u8>,
    max_skew: Duration,
    signature_header: &'static str,
    timestamp_header: &'static str,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("channel", &self.channel)
            .field("max_skew", &self.max_skew)
            .field("signature_header", &self.signature_header)
            .field("timestamp_header", &self.timestamp_header)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(
        channel: &'static str,
        secret: impl Into<Vec<u8>>,
        max_skew: Duration,
        signature_header: &'static str,
        timestamp_header: &'static str,
    ) -> Self {
        Self {
            channel,
            secret: secret.into(),
            max_skew,
            signature_header,
            timestamp_header,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the time source. Tests pin it; production never calls this.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn channel(&self) -> &'static str {
        self.channel
    }

    pub fn signature_header(&self) -> &'static str {
        self.signature_header
    }

    pub fn timestamp_header(&self) -> &'static str {
        self.timestamp_header
    }

    /// Checks one request. `signature` and `timestamp` are the raw header
    /// values (if present); `body` is the exact byte payload received.
    pub fn verify(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
    ) -> Result<(), AuthError> {
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingSignature)?;
        // The MAC covers the header exactly as sent; only the parse is lenient.
        let timestamp = timestamp
            .filter(|s| !s.trim().is_empty())
            .ok_or(AuthError::MissingTimestamp)?;
        let issued_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| AuthError::MissingTimestamp)?;

        let now = self.clock.now().timestamp();
        let skew = now.abs_diff(issued_at);
        if skew > self.max_skew.as_secs() {
            tracing::debug!(channel = self.channel, skew_secs = skew, "rejecting stale timestamp");
            return Err(AuthError::StaleTimestamp);
        }

        let provided = hex::decode(signature).map_err(|_| AuthError::InvalidSignature)?;
        let mut mac = self.mac();
        mac.update(timestamp.as_bytes());
        mac.update(body);
        mac.verify_slice(&provided)
            .map_err(|_| AuthError::InvalidSignature)
    }

    /// Produces the signature a well-behaved sender would attach.
    pub fn sign(&self, timestamp: &str, body: &[u8]) -> String {
        sign_payload(&self.secret, timestamp, body)
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, so this cannot fail.
        <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"))
    }
}

/// `hex(HMAC-SHA256(secret, timestamp || body))`, lowercase.
pub fn sign_payload(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(timestamp.as_bytes());
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{
        INTENT_SIGNATURE_HEADER, INTENT_TIMESTAMP_HEADER, SETTLEMENT_SIGNATURE_HEADER,
        SETTLEMENT_TIMESTAMP_HEADER,
    };

    const NOW: i64 = 1_700_000_000;

    fn verifier(secret: &str) -> SignatureVerifier {
        SignatureVerifier::new(
            "intent",
            secret,
            Duration::from_secs(60),
            INTENT_SIGNATURE_HEADER,
            INTENT_TIMESTAMP_HEADER,
        )
        .with_clock(Arc::new(ManualClock::at_unix(NOW)))
    }

    #[test]
    fn accepts_valid_signature() {
        let v = verifier("secret");
        let body = br#"{"hello":"world"}"#;
        let ts = NOW.to_string();
        let sig = sign_payload(b"secret", &ts, body);
        assert_eq!(v.verify(Some(&sig), Some(&ts), body), Ok(()));
    }

    #[test]
    fn accepts_uppercase_hex() {
        let v = verifier("secret");
        let ts = NOW.to_string();
        let sig = sign_payload(b"secret", &ts, b"{}").to_uppercase();
        assert_eq!(v.verify(Some(&sig), Some(&ts), b"{}"), Ok(()));
    }

    #[test]
    fn rejects_tampered_body() {
        let v = verifier("secret");
        let ts = NOW.to_string();
        let sig = sign_payload(b"secret", &ts, br#"{"amount":"1"}"#);
        assert_eq!(
            v.verify(Some(&sig), Some(&ts), br#"{"amount":"9"}"#),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_garbage_signature() {
        let v = verifier("secret");
        let ts = NOW.to_string();
        assert_eq!(
            v.verify(Some("deadbeef"), Some(&ts), b"{}"),
            Err(AuthError::InvalidSignature)
        );
        assert_eq!(
            v.verify(Some("not-hex"), Some(&ts), b"{}"),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_missing_headers() {
        let v = verifier("secret");
        let ts = NOW.to_string();
        assert_eq!(v.verify(None, Some(&ts), b"{}"), Err(AuthError::MissingSignature));
        assert_eq!(v.verify(Some("ab"), None, b"{}"), Err(AuthError::MissingTimestamp));
        assert_eq!(
            v.verify(Some("ab"), Some("yesterday"), b"{}"),
            Err(AuthError::MissingTimestamp)
        );
    }

    #[test]
    fn rejects_skew_in_both_directions() {
        let v = verifier("secret");
        for ts in [NOW - 61, NOW + 61] {
            let ts = ts.to_string();
            let sig = sign_payload(b"secret", &ts, b"{}");
            assert_eq!(
                v.verify(Some(&sig), Some(&ts), b"{}"),
                Err(AuthError::StaleTimestamp)
            );
        }
        let edge = (NOW + 60).to_string();
        let sig = sign_payload(b"secret", &edge, b"{}");
        assert_eq!(v.verify(Some(&sig), Some(&edge), b"{}"), Ok(()));
    }

    #[test]
    fn channels_do_not_share_secrets() {
        let intent = verifier("intent-secret");
        let settlement = SignatureVerifier::new(
            "settlement",
            "settlement-secret",
            Duration::from_secs(30),
            SETTLEMENT_SIGNATURE_HEADER,
            SETTLEMENT_TIMESTAMP_HEADER,
        )
        .with_clock(Arc::new(ManualClock::at_unix(NOW)));

        let ts = NOW.to_string();
        let forged = intent.sign(&ts, b"{}");
        assert_eq!(
            settlement.verify(Some(&forged), Some(&ts), b"{}"),
            Err(AuthError::InvalidSignature)
        );
        assert_eq!(settlement.signature_header(), SETTLEMENT_SIGNATURE_HEADER);
    }

    #[test]
    fn timestamp_is_signed_exactly_as_sent() {
        let v = verifier("secret");
        let padded = format!(" {NOW} ");
        let signed_padded = sign_payload(b"secret", &padded, b"{}");
        assert_eq!(v.verify(Some(&signed_padded), Some(&padded), b"{}"), Ok(()));

        // A signature over the trimmed value does not cover the padded header.
        let signed_trimmed = sign_payload(b"secret", &NOW.to_string(), b"{}");
        assert_eq!(
            v.verify(Some(&signed_trimmed), Some(&padded), b"{}"),
            Err(AuthError::InvalidSignature)
        );
    }
}
