//! # Prometheus Metrics
//!
//! Operational metrics for the settlement service, scraped at `/metrics` on
//! the metrics port and mirrored at `/api/v1/metrics` on the API port.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] under the
//! `mintbridge` namespace so they do not collide with the default global
//! registry.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use mintbridge_protocol::dead_letter::DeadLetterSink;
use mintbridge_protocol::settlement::{ExecutionError, ExecutionReport};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metric handles for the service.
#[derive(Clone)]
pub struct BridgeMetrics {
    registry: Registry,
    /// Submissions by outcome: `accepted`, `replayed`, `invalid`,
    /// `rejected`, `in_progress`, `error`.
    pub intent_submissions_total: IntCounterVec,
    /// Settlement notifications by outcome: `processed`, `replayed`,
    /// `invalid`, `rejected`, `dead_lettered`, `cancelled`, `in_progress`,
    /// `error`.
    pub settlement_notifications_total: IntCounterVec,
    /// Retry engine activity by result: `retry` per backoff taken,
    /// `success` per settled notification, `failed` per exhaustion.
    pub retry_attempts_total: IntCounterVec,
    /// Requests refused by a signature check, by channel.
    pub auth_failures_total: IntCounterVec,
    /// Entries currently in the dead letter queue.
    pub dead_letter_depth: IntGauge,
}

impl BridgeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("mintbridge".into()), None)?;

        let intent_submissions_total = IntCounterVec::new(
            Opts::new("intent_submissions_total", "Intent submissions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(intent_submissions_total.clone()))?;

        let settlement_notifications_total = IntCounterVec::new(
            Opts::new(
                "settlement_notifications_total",
                "Settlement notifications by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(settlement_notifications_total.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Settlement retry activity by result"),
            &["result"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let auth_failures_total = IntCounterVec::new(
            Opts::new("auth_failures_total", "Requests rejected by signature checks"),
            &["channel"],
        )?;
        registry.register(Box::new(auth_failures_total.clone()))?;

        let dead_letter_depth =
            IntGauge::new("dead_letter_depth", "Entries in the dead letter queue")?;
        registry.register(Box::new(dead_letter_depth.clone()))?;

        Ok(Self {
            registry,
            intent_submissions_total,
            settlement_notifications_total,
            retry_attempts_total,
            auth_failures_total,
            dead_letter_depth,
        })
    }

    pub fn submission(&self, outcome: &str) {
        self.intent_submissions_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn notification(&self, outcome: &str) {
        self.settlement_notifications_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Folds one executor result into the retry counters.
    pub fn record_execution(&self, result: &Result<ExecutionReport, ExecutionError>) {
        let retries = match result {
            Ok(report) => report.retries(),
            Err(err) => err.retries(),
        };
        if retries > 0 {
            self.retry_attempts_total
                .with_label_values(&["retry"])
                .inc_by(u64::from(retries));
        }
        match result {
            Ok(_) => self.retry_attempts_total.with_label_values(&["success"]).inc(),
            Err(ExecutionError::Exhausted { .. }) => {
                self.retry_attempts_total.with_label_values(&["failed"]).inc()
            }
            Err(_) => {}
        }
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<BridgeMetrics>;

/// State for the standalone metrics router.
#[derive(Clone)]
pub struct MetricsState {
    pub metrics: SharedMetrics,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

/// Refreshes the dead letter gauge and renders the exposition text.
pub fn render(metrics: &BridgeMetrics, dead_letters: &dyn DeadLetterSink) -> Response {
    metrics.dead_letter_depth.set(dead_letters.depth() as i64);
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

/// Axum handler that renders `/metrics` on the metrics port.
pub async fn metrics_handler(State(state): State<MetricsState>) -> Response {
    render(&state.metrics, state.dead_letters.as_ref())
}
