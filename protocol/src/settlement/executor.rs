//! Drives `execute_mint` for one notification until it succeeds, hits a
//! terminal error, runs out of attempts, or is cancelled.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{RetryPolicy, SettlementNotification};
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::ledger::{LedgerClient, LedgerError};

/// A settlement that went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub settlement_ref: String,
    /// Ledger calls made, including the successful one.
    pub attempts: u32,
}

impl ExecutionReport {
    /// Attempts that were followed by another attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// A settlement that did not go through.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    /// The ledger refused for a business reason. Not retried, not dead
    /// lettered.
    #[error("{error}")]
    Terminal { error: LedgerError, attempts: u32 },

    /// Every attempt hit a transient fault. The notification was handed to
    /// the dead letter sink; `dead_letter_id` is `None` if that write failed.
    #[error("settlement failed after {attempts} attempts: {error}")]
    Exhausted {
        error: LedgerError,
        attempts: u32,
        dead_letter_id: Option<String>,
    },

    /// The caller went away mid-backoff. Nothing was recorded.
    #[error("settlement cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl ExecutionError {
    pub fn attempts(&self) -> u32 {
        match self {
            ExecutionError::Terminal { attempts, .. }
            | ExecutionError::Exhausted { attempts, .. }
            | ExecutionError::Cancelled { attempts } => *attempts,
        }
    }

    /// Attempts that were followed by a backoff, whether or not the next
    /// attempt ran.
    pub fn retries(&self) -> u32 {
        match self {
            ExecutionError::Cancelled { attempts } => *attempts,
            other => other.attempts().saturating_sub(1),
        }
    }
}

/// Settlement retry engine. One instance is shared by every request
/// handler; each call to [`execute`](Self::execute) is independent.
#[derive(Clone)]
pub struct SettlementExecutor {
    ledger: Arc<dyn LedgerClient>,
    policy: RetryPolicy,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl SettlementExecutor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        policy: RetryPolicy,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            ledger,
            policy,
            dead_letters,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs the retry loop for `notification`.
    ///
    /// `payload` is the notification as received; it is what lands in the
    /// dead letter sink on exhaustion. `cancel` resolving during a backoff
    /// ends the loop at once with [`ExecutionError::Cancelled`]. A ledger
    /// call already in flight is allowed to finish so its outcome is never
    /// left unknown.
    pub async fn execute<C>(
        &self,
        notification: &SettlementNotification,
        payload: &serde_json::Value,
        cancel: C,
    ) -> Result<ExecutionReport, ExecutionError>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let intent_id = notification.intent_id.as_str();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match self.ledger.execute_mint(intent_id).await {
                Ok(settlement_ref) => {
                    info!(intent_id, attempt, %settlement_ref, "settlement executed");
                    return Ok(ExecutionReport {
                        settlement_ref,
                        attempts: attempt,
                    });
                }
                Err(error) if !error.is_retryable() => {
                    warn!(intent_id, attempt, kind = ?error.kind(), %error, "settlement rejected");
                    return Err(ExecutionError::Terminal {
                        error,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if !self.policy.allows_retry_after(attempt) {
                return Err(self.exhaust(notification, payload, error, attempt));
            }

            let wait = self.policy.delay(attempt, &mut rand::thread_rng());
            debug!(
                intent_id,
                attempt,
                wait_ms = wait.as_millis() as u64,
                %error,
                "transient settlement failure, backing off"
            );
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    info!(intent_id, attempt, "settlement cancelled during backoff");
                    return Err(ExecutionError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn exhaust(
        &self,
        notification: &SettlementNotification,
        payload: &serde_json::Value,
        error: LedgerError,
        attempts: u32,
    ) -> ExecutionError {
        let letter = DeadLetter {
            payment_reference: notification.payment_reference.clone(),
            intent_id: notification.intent_id.clone(),
            payload: payload.clone(),
            error: error.to_string(),
            attempts,
        };
        let dead_letter_id = match self.dead_letters.append(letter) {
            Ok(entry) => Some(entry.id),
            Err(sink_error) => {
                error!(
                    intent_id = %notification.intent_id,
                    payment_reference = %notification.payment_reference,
                    %sink_error,
                    "failed to persist dead letter"
                );
                None
            }
        };
        ExecutionError::Exhausted {
            error,
            attempts,
            dead_letter_id,
        }
    }
}
