//! # REST API
//!
//! Builds the axum router for the settlement service. All endpoints share
//! application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                         | Auth       | Description                    |
//! |--------|------------------------------|------------|--------------------------------|
//! | POST   | `/api/v1/intents`            | intent     | Submit a mint intent           |
//! | POST   | `/api/v1/intents/:id/refund` | intent     | Refund a pending intent        |
//! | GET    | `/api/v1/intents/:id`        | none       | Intent by id                   |
//! | POST   | `/api/v1/settlements`        | settlement | Settlement notification        |
//! | GET    | `/api/v1/health`             | none       | Dependency health              |
//! | GET    | `/api/v1/metrics`            | none       | Prometheus text exposition     |
//!
//! Signed routes sit behind [`require_signature`], which buffers the body,
//! checks the channel's HMAC and timestamp, and hands the same bytes on to
//! the handler. The two channels use separate secrets and headers.
//!
//! ## Idempotency
//!
//! Both write channels claim their key before touching the ledger. A second
//! request with a live claim gets `409 request in progress`. Only successful
//! outcomes are stored; on failure the claim is released so a retry runs the
//! operation again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use mintbridge_protocol::auth::SignatureVerifier;
use mintbridge_protocol::clock::Clock;
use mintbridge_protocol::config::{
    ServiceConfig, IDEMPOTENCY_KEY_HEADER, MAX_SIGNED_BODY_BYTES, REQUEST_ID_HEADER,
    SETTLEMENT_KEY_PREFIX,
};
use mintbridge_protocol::dead_letter::DeadLetterSink;
use mintbridge_protocol::idempotency::{Claim, IdempotencyRecord, IdempotencyStore};
use mintbridge_protocol::ledger::{
    is_well_formed_intent_id, ErrorKind, Intent, IntentStatus, LedgerClient, LedgerError,
    SubmitIntent,
};
use mintbridge_protocol::settlement::{ExecutionError, SettlementExecutor, SettlementNotification};

use crate::metrics::{self, SharedMetrics};

/// Header set on responses served from the idempotency store.
pub const REPLAY_HEADER: &str = "x-idempotent-replay";

/// Longest accepted caller-supplied idempotency key.
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Time windows the handlers apply per request.
#[derive(Debug, Clone, Copy)]
pub struct RequestWindows {
    /// How long a successful outcome is replayed.
    pub idempotency_window: Duration,
    /// How long an in-flight claim blocks other callers.
    pub claim_ttl: Duration,
    /// Upper bound on one notification's retry loop.
    pub notification_deadline: Duration,
}

impl From<&ServiceConfig> for RequestWindows {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            idempotency_window: cfg.idempotency_window(),
            claim_ttl: cfg.claim_ttl(),
            notification_deadline: cfg.notification_deadline(),
        }
    }
}

/// Shared application state available to all request handlers.
///
/// Cheap to clone, everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub ledger: Arc<dyn LedgerClient>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub executor: SettlementExecutor,
    pub intent_auth: Arc<SignatureVerifier>,
    pub settlement_auth: Arc<SignatureVerifier>,
    pub metrics: SharedMetrics,
    pub clock: Arc<dyn Clock>,
    pub windows: RequestWindows,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, request ids, and
/// tracing.
pub fn create_router(state: AppState) -> Router {
    let intent_channel = SignedChannel {
        verifier: state.intent_auth.clone(),
        metrics: state.metrics.clone(),
    };
    let settlement_channel = SignedChannel {
        verifier: state.settlement_auth.clone(),
        metrics: state.metrics.clone(),
    };

    let intents = Router::new()
        .route("/api/v1/intents", post(submit_intent_handler))
        .route("/api/v1/intents/:id/refund", post(refund_intent_handler))
        .route_layer(middleware::from_fn_with_state(
            intent_channel,
            require_signature,
        ));

    let settlements = Router::new()
        .route("/api/v1/settlements", post(settlement_handler))
        .route_layer(middleware::from_fn_with_state(
            settlement_channel,
            require_signature,
        ));

    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/metrics", get(metrics_handler))
        .route("/api/v1/intents/:id", get(get_intent_handler))
        .merge(intents)
        .merge(settlements)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .headers()
                            .get(REQUEST_ID_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-");
                        tracing::info_span!(
                            "request",
                            method = %request.method(),
                            path = %request.uri().path(),
                            request_id,
                        )
                    }),
                )
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_id: Option<String>,
}

/// A failed request, with the metrics outcome it counts as.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    outcome: &'static str,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, outcome: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            outcome,
            body: ErrorResponse {
                error: message.into(),
                kind: None,
                dead_letter_id: None,
            },
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid", message)
            .with_kind(ErrorKind::Validation)
    }

    fn in_progress() -> Self {
        Self::new(StatusCode::CONFLICT, "in_progress", "request in progress")
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "error", message)
    }

    fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.body.kind = Some(kind);
        self
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::InvalidAmount { .. }
            | LedgerError::InvalidMarket(_)
            | LedgerError::InvalidIntentId(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::DuplicatePaymentReference(_)
            | LedgerError::AlreadyExists(_)
            | LedgerError::AlreadyExecuted { .. }
            | LedgerError::InsufficientFunds { .. } => StatusCode::CONFLICT,
            LedgerError::NotCompliant(_) => StatusCode::FORBIDDEN,
            LedgerError::DailyLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            // The service's own credential was refused: misconfiguration.
            LedgerError::Unauthorized(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LedgerError::Transient(_) => StatusCode::BAD_GATEWAY,
        };
        let outcome = if err.is_retryable() { "error" } else { "rejected" };
        Self::new(status, outcome, err.to_string()).with_kind(err.kind())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// A completed request and the metrics outcome it counts as.
struct Handled {
    outcome: &'static str,
    response: Response,
}

// ---------------------------------------------------------------------------
// Signature Middleware
// ---------------------------------------------------------------------------

/// Middleware state for one signed channel.
#[derive(Clone)]
pub struct SignedChannel {
    verifier: Arc<SignatureVerifier>,
    metrics: SharedMetrics,
}

/// Verifies the channel signature over the exact body bytes, then forwards
/// the request with the body restored.
pub async fn require_signature(
    State(channel): State<SignedChannel>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_SIGNED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid",
                "request body too large",
            )
            .into_response()
        }
    };

    let verifier = &channel.verifier;
    let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
    let verdict = verifier.verify(
        header(verifier.signature_header()),
        header(verifier.timestamp_header()),
        &bytes,
    );
    if let Err(err) = verdict {
        channel
            .metrics
            .auth_failures_total
            .with_label_values(&[verifier.channel()])
            .inc();
        warn!(
            channel = verifier.channel(),
            path = %parts.uri.path(),
            error = %err,
            "request rejected by signature check"
        );
        return ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
            .into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

// ---------------------------------------------------------------------------
// Idempotency Helpers
// ---------------------------------------------------------------------------

/// Takes the claim on `key`, or answers from the store.
fn claim(state: &AppState, key: &str) -> Result<Option<Handled>, ApiError> {
    let claim = state
        .idempotency
        .claim(key, state.windows.claim_ttl)
        .map_err(|e| {
            error!(key, error = %e, "idempotency store unavailable");
            ApiError::internal("idempotency store unavailable")
        })?;
    match claim {
        Claim::Acquired => Ok(None),
        Claim::InFlight => {
            debug!(key, "claim held by another request");
            Err(ApiError::in_progress())
        }
        Claim::Completed(record) => {
            info!(key, status = record.status_code, "idempotent replay");
            Ok(Some(Handled {
                outcome: "replayed",
                response: replay(record),
            }))
        }
    }
}

/// Stores a successful outcome or releases the claim on failure.
fn settle_claim(
    state: &AppState,
    key: &str,
    result: Result<(StatusCode, Vec<u8>), ApiError>,
    outcome: &'static str,
) -> Result<Handled, ApiError> {
    match result {
        Ok((status, body)) => {
            let record = IdempotencyRecord::new(
                key,
                status.as_u16(),
                body.clone(),
                state.clock.now(),
                state.windows.idempotency_window,
            );
            // The ledger already changed; the caller gets the success either
            // way and a retry after the claim lapses is rejected by the ledger.
            if let Err(e) = state.idempotency.save(key, record) {
                error!(key, error = %e, "failed to store idempotent outcome");
            }
            Ok(Handled {
                outcome,
                response: json_bytes(status, body),
            })
        }
        Err(err) => {
            if let Err(e) = state.idempotency.release(key) {
                warn!(key, error = %e, "failed to release idempotency claim");
            }
            Err(err)
        }
    }
}

fn replay(record: IdempotencyRecord) -> Response {
    let status = StatusCode::from_u16(record.status_code).unwrap_or(StatusCode::OK);
    let mut response = json_bytes(status, record.response_body);
    response
        .headers_mut()
        .insert(REPLAY_HEADER, HeaderValue::from_static("true"));
    response
}

fn json_bytes(status: StatusCode, body: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(body),
    )
        .into_response()
}

fn to_json<T: Serialize>(status: StatusCode, value: &T) -> Result<(StatusCode, Vec<u8>), ApiError> {
    serde_json::to_vec(value)
        .map(|body| (status, body))
        .map_err(|e| ApiError::internal(format!("failed to encode response: {e}")))
}

/// Parses a smallest-unit decimal amount.
fn parse_units(raw: &str) -> Option<u128> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u128>().ok().filter(|units| *units > 0)
}

// ---------------------------------------------------------------------------
// Intent Submission
// ---------------------------------------------------------------------------

/// Body of `POST /api/v1/intents`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitIntentRequest {
    pub depositor: String,
    /// Smallest-unit decimal string.
    pub amount: String,
    pub market_code: String,
    pub payment_reference: String,
}

impl SubmitIntentRequest {
    fn into_submission(self) -> Result<SubmitIntent, ApiError> {
        for (name, value) in [
            ("depositor", &self.depositor),
            ("amount", &self.amount),
            ("marketCode", &self.market_code),
            ("paymentReference", &self.payment_reference),
        ] {
            if value.trim().is_empty() {
                return Err(ApiError::invalid(format!("missing required field '{name}'")));
            }
        }
        let amount = parse_units(&self.amount).ok_or_else(|| {
            ApiError::invalid(format!("amount '{}' is not a positive integer", self.amount))
        })?;
        Ok(SubmitIntent {
            depositor: self.depositor,
            amount,
            market_code: self.market_code,
            payment_reference: self.payment_reference,
        })
    }
}

/// Success body for intent submission.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentAccepted {
    pub intent_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_ref: Option<String>,
}

async fn submit_intent_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    match submit_intent(&state, &headers, &body).await {
        Ok(handled) => {
            state.metrics.submission(handled.outcome);
            Ok(handled.response)
        }
        Err(err) => {
            state.metrics.submission(err.outcome);
            Err(err)
        }
    }
}

async fn submit_intent(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Handled, ApiError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::invalid("missing idempotency key"))?;
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN || key.starts_with(SETTLEMENT_KEY_PREFIX) {
        return Err(ApiError::invalid("unusable idempotency key"));
    }

    let request: SubmitIntentRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::invalid(format!("malformed body: {e}")))?;
    let submission = request.into_submission()?;

    if let Some(replayed) = claim(state, key)? {
        return Ok(replayed);
    }

    let reference = submission.payment_reference.clone();
    let result = match state.ledger.submit_intent(submission).await {
        Ok(intent_id) => {
            info!(%intent_id, payment_reference = %reference, "intent accepted");
            to_json(
                StatusCode::CREATED,
                &IntentAccepted {
                    intent_id,
                    status: "submitted".into(),
                    settlement_ref: None,
                },
            )
        }
        Err(err) => {
            warn!(payment_reference = %reference, kind = ?err.kind(), error = %err, "intent rejected");
            Err(ApiError::from(err))
        }
    };
    settle_claim(state, key, result, "accepted")
}

// ---------------------------------------------------------------------------
// Settlement Notification
// ---------------------------------------------------------------------------

/// Success body for a settlement notification.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementProcessed {
    pub status: String,
    pub intent_id: String,
    pub settlement_ref: String,
}

async fn settlement_handler(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    match handle_notification(&state, &body).await {
        Ok(handled) => {
            state.metrics.notification(handled.outcome);
            Ok(handled.response)
        }
        Err(err) => {
            state.metrics.notification(err.outcome);
            Err(err)
        }
    }
}

async fn handle_notification(state: &AppState, body: &[u8]) -> Result<Handled, ApiError> {
    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::invalid(format!("malformed body: {e}")))?;
    let notification: SettlementNotification = serde_json::from_value(payload.clone())
        .map_err(|e| ApiError::invalid(format!("malformed body: {e}")))?;
    notification
        .validate()
        .map_err(|e| ApiError::invalid(e.to_string()))?;

    let key = notification.idempotency_key();
    if let Some(replayed) = claim(state, &key)? {
        return Ok(replayed);
    }

    let result = execute_notification(state, &notification, &payload).await;
    settle_claim(state, &key, result, "processed")
}

async fn execute_notification(
    state: &AppState,
    notification: &SettlementNotification,
    payload: &serde_json::Value,
) -> Result<(StatusCode, Vec<u8>), ApiError> {
    let units = notification
        .amount_units()
        .map_err(|e| ApiError::invalid(e.to_string()))?;
    if let Some(intent) = state.ledger.get_intent(&notification.intent_id).await {
        if intent.payment_reference != notification.payment_reference
            || intent.depositor != notification.depositor
            || intent.amount != units
        {
            warn!(
                intent_id = %notification.intent_id,
                payment_reference = %notification.payment_reference,
                "notification does not match intent"
            );
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "rejected",
                "notification does not match intent",
            )
            .with_kind(ErrorKind::Conflict));
        }
    }

    let deadline = tokio::time::sleep(state.windows.notification_deadline);
    let result = state.executor.execute(notification, payload, deadline).await;
    state.metrics.record_execution(&result);

    match result {
        Ok(report) => to_json(
            StatusCode::OK,
            &SettlementProcessed {
                status: "processed".into(),
                intent_id: notification.intent_id.clone(),
                settlement_ref: report.settlement_ref,
            },
        ),
        Err(ExecutionError::Terminal { error, .. }) => Err(ApiError::from(error)),
        Err(ExecutionError::Exhausted {
            error,
            attempts,
            dead_letter_id,
        }) => {
            state
                .metrics
                .dead_letter_depth
                .set(state.dead_letters.depth() as i64);
            let mut api = ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "dead_lettered",
                format!("settlement failed after {attempts} attempts: {error}"),
            )
            .with_kind(ErrorKind::TransientInfra);
            api.body.dead_letter_id = dead_letter_id;
            Err(api)
        }
        Err(ExecutionError::Cancelled { attempts }) => {
            warn!(intent_id = %notification.intent_id, attempts, "settlement deadline exceeded");
            Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "cancelled",
                "settlement deadline exceeded",
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Intent Query and Refund
// ---------------------------------------------------------------------------

/// An intent as returned by the API. Amounts are decimal strings.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentView {
    pub id: String,
    pub depositor: String,
    pub amount: String,
    pub market_code: String,
    pub payment_reference: String,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub settlement_ref: Option<String>,
    pub refund_reason: Option<String>,
}

impl From<Intent> for IntentView {
    fn from(intent: Intent) -> Self {
        Self {
            id: intent.id,
            depositor: intent.depositor,
            amount: intent.amount.to_string(),
            market_code: intent.market_code,
            payment_reference: intent.payment_reference,
            status: intent.status,
            created_at: intent.created_at,
            settled_at: intent.settled_at,
            settlement_ref: intent.settlement_ref,
            refund_reason: intent.refund_reason,
        }
    }
}

async fn get_intent_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IntentView>, ApiError> {
    if !is_well_formed_intent_id(&id) {
        return Err(LedgerError::InvalidIntentId(id).into());
    }
    match state.ledger.get_intent(&id).await {
        Some(intent) => Ok(Json(intent.into())),
        None => Err(LedgerError::NotFound(id).into()),
    }
}

/// Body of `POST /api/v1/intents/:id/refund`.
#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub reason: String,
}

/// Success body for a refund.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRefunded {
    pub status: String,
    pub intent_id: String,
    pub settlement_ref: String,
}

async fn refund_intent_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<IntentRefunded>, ApiError> {
    let request: RefundRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid(format!("malformed body: {e}")))?;
    if request.reason.trim().is_empty() {
        return Err(ApiError::invalid("missing required field 'reason'"));
    }

    let settlement_ref = state
        .ledger
        .refund_intent(&id, request.reason.trim())
        .await
        .map_err(|err| {
            warn!(intent_id = %id, error = %err, "refund rejected");
            ApiError::from(err)
        })?;
    info!(intent_id = %id, %settlement_ref, "intent refunded");
    Ok(Json(IntentRefunded {
        status: "refunded".into(),
        intent_id: id,
        settlement_ref,
    }))
}

// ---------------------------------------------------------------------------
// Health and Metrics
// ---------------------------------------------------------------------------

/// Reachability of one dependency.
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response body for `GET /api/v1/health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub ledger: DependencyHealth,
    pub database: DependencyHealth,
    pub queue_depth: usize,
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let ledger = match state.ledger.ping().await {
        Ok(()) => DependencyHealth {
            connected: true,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => DependencyHealth {
            connected: false,
            latency_ms: None,
            error: Some(e.to_string()),
        },
    };
    let database = match state.idempotency.ping() {
        Ok(()) => DependencyHealth {
            connected: true,
            latency_ms: None,
            error: None,
        },
        Err(e) => DependencyHealth {
            connected: false,
            latency_ms: None,
            error: Some(e.to_string()),
        },
    };

    let queue_depth = state.dead_letters.depth();
    state.metrics.dead_letter_depth.set(queue_depth as i64);

    let healthy = ledger.connected && database.connected;
    if !healthy {
        warn!(
            ledger = ?ledger.error,
            database = ?database.error,
            "health check degraded"
        );
    }
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" }.into(),
            version: state.version.clone(),
            timestamp: state.clock.now(),
            ledger,
            database,
            queue_depth,
        }),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    metrics::render(&state.metrics, state.dead_letters.as_ref())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mintbridge_contracts::{
        AccessControl, AssetLedger, ComplianceRecord, ComplianceRegistry, Credential,
        EscrowClient, EscrowSettings, MintEscrow, Role,
    };
    use mintbridge_protocol::clock::ManualClock;
    use mintbridge_protocol::config::{
        ComplianceConfig, INTENT_SIGNATURE_HEADER, INTENT_TIMESTAMP_HEADER,
        SETTLEMENT_SIGNATURE_HEADER, SETTLEMENT_TIMESTAMP_HEADER,
    };
    use mintbridge_protocol::dead_letter::DeadLetterQueue;
    use mintbridge_protocol::idempotency::SledIdempotencyStore;
    use mintbridge_protocol::ledger::IntentId;
    use mintbridge_protocol::settlement::RetryPolicy;
    use mintbridge_protocol::storage::BridgeDb;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tower::ServiceExt;

    const UNIT: u128 = 1_000_000_000_000_000_000;
    const INTENT_SECRET: &[u8] = b"intent-secret";
    const SETTLEMENT_SECRET: &[u8] = b"settlement-secret";
    const DEPOSITOR: &str = "0xdepositor";

    /// Escrow client that can be told to fail `execute_mint` transiently
    /// or to stop answering pings.
    struct FlakyLedger {
        inner: EscrowClient,
        failures: AtomicU32,
        executions: AtomicU32,
        down: AtomicBool,
    }

    #[async_trait]
    impl LedgerClient for FlakyLedger {
        async fn submit_intent(&self, request: SubmitIntent) -> Result<IntentId, LedgerError> {
            self.inner.submit_intent(request).await
        }

        async fn execute_mint(&self, intent_id: &str) -> Result<String, LedgerError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let injected = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(LedgerError::Transient("connection refused".into()));
            }
            self.inner.execute_mint(intent_id).await
        }

        async fn refund_intent(&self, intent_id: &str, reason: &str) -> Result<String, LedgerError> {
            self.inner.refund_intent(intent_id, reason).await
        }

        async fn get_intent(&self, intent_id: &str) -> Option<Intent> {
            self.inner.get_intent(intent_id).await
        }

        async fn get_status(&self, intent_id: &str) -> Option<IntentStatus> {
            self.inner.get_status(intent_id).await
        }

        async fn ping(&self) -> Result<(), LedgerError> {
            if self.down.load(Ordering::SeqCst) {
                Err(LedgerError::Transient("ledger unreachable".into()))
            } else {
                Ok(())
            }
        }
    }

    struct TestApp {
        router: Router,
        clock: Arc<ManualClock>,
        ledger: Arc<FlakyLedger>,
        escrow: Arc<MintEscrow>,
        registry: Arc<ComplianceRegistry>,
        idempotency: Arc<SledIdempotencyStore>,
        dead_letters: Arc<DeadLetterQueue>,
        metrics: SharedMetrics,
    }

    fn test_app() -> TestApp {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let db = BridgeDb::open_temporary().unwrap();

        let admin = Credential::new("ops-admin");
        let access = Arc::new(AccessControl::new(&admin));
        access
            .grant(&admin, "mintbridge-node", Role::Executor)
            .unwrap();

        let registry = Arc::new(ComplianceRegistry::with_clock(
            ComplianceConfig::default(),
            clock.clone(),
        ));
        let assets = Arc::new(AssetLedger::new("USDC"));
        assets.fund(DEPOSITOR, 100 * UNIT).unwrap();

        let settings = EscrowSettings {
            min_amount: 1,
            max_amount: 10 * UNIT,
            daily_limit: 10 * UNIT,
            markets: BTreeMap::from([
                ("X".to_string(), "XT".to_string()),
                ("KES".to_string(), "cKES".to_string()),
            ]),
        };
        let escrow = Arc::new(
            MintEscrow::new(settings, access, registry.clone(), assets)
                .with_clock(clock.clone())
                .with_journal(Arc::new(db.ledger_journal()))
                .unwrap(),
        );
        let ledger = Arc::new(FlakyLedger {
            inner: EscrowClient::new(escrow.clone(), Credential::new("mintbridge-node")),
            failures: AtomicU32::new(0),
            executions: AtomicU32::new(0),
            down: AtomicBool::new(false),
        });

        let idempotency = Arc::new(db.idempotency_store(clock.clone()));
        let dead_letters = Arc::new(db.dead_letter_queue(clock.clone()));
        let metrics = Arc::new(crate::metrics::BridgeMetrics::new().unwrap());
        let executor =
            SettlementExecutor::new(ledger.clone(), RetryPolicy::default(), dead_letters.clone());

        let state = AppState {
            version: "0.1.0-test".into(),
            ledger: ledger.clone(),
            idempotency: idempotency.clone(),
            dead_letters: dead_letters.clone(),
            executor,
            intent_auth: Arc::new(
                SignatureVerifier::new(
                    "intent",
                    INTENT_SECRET,
                    Duration::from_secs(60),
                    INTENT_SIGNATURE_HEADER,
                    INTENT_TIMESTAMP_HEADER,
                )
                .with_clock(clock.clone()),
            ),
            settlement_auth: Arc::new(
                SignatureVerifier::new(
                    "settlement",
                    SETTLEMENT_SECRET,
                    Duration::from_secs(60),
                    SETTLEMENT_SIGNATURE_HEADER,
                    SETTLEMENT_TIMESTAMP_HEADER,
                )
                .with_clock(clock.clone()),
            ),
            metrics: metrics.clone(),
            clock: clock.clone(),
            windows: RequestWindows {
                idempotency_window: Duration::from_secs(24 * 60 * 60),
                claim_ttl: Duration::from_secs(120),
                notification_deadline: Duration::from_secs(60),
            },
        };

        TestApp {
            router: create_router(state),
            clock,
            ledger,
            escrow,
            registry,
            idempotency,
            dead_letters,
            metrics,
        }
    }

    impl TestApp {
        fn make_compliant(&self, depositor: &str) {
            self.registry.set_record(
                depositor,
                ComplianceRecord {
                    risk_score: 5,
                    attestation: Some("kyc-001".into()),
                    attested_at: self.clock.now(),
                },
            );
        }

        fn timestamp(&self) -> String {
            self.clock.now().timestamp().to_string()
        }

        fn intent_request(&self, path: &str, body: &serde_json::Value, key: Option<&str>) -> Request<Body> {
            let bytes = serde_json::to_vec(body).unwrap();
            let ts = self.timestamp();
            let signature = mintbridge_protocol::auth::sign_payload(INTENT_SECRET, &ts, &bytes);
            let mut builder = Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .header(INTENT_SIGNATURE_HEADER, signature)
                .header(INTENT_TIMESTAMP_HEADER, ts);
            if let Some(key) = key {
                builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
            }
            builder.body(Body::from(bytes)).unwrap()
        }

        fn settlement_request(&self, body: &serde_json::Value) -> Request<Body> {
            let bytes = serde_json::to_vec(body).unwrap();
            let ts = self.timestamp();
            let signature = mintbridge_protocol::auth::sign_payload(SETTLEMENT_SECRET, &ts, &bytes);
            Request::builder()
                .method("POST")
                .uri("/api/v1/settlements")
                .header("content-type", "application/json")
                .header(SETTLEMENT_SIGNATURE_HEADER, signature)
                .header(SETTLEMENT_TIMESTAMP_HEADER, ts)
                .body(Body::from(bytes))
                .unwrap()
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
            let resp = self.router.clone().oneshot(request).await.unwrap();
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp
                .into_body()
                .collect()
                .await
                .unwrap()
                .to_bytes()
                .to_vec();
            (status, headers, body)
        }

        async fn get(&self, path: &str) -> (StatusCode, Vec<u8>) {
            let req = Request::builder().uri(path).body(Body::empty()).unwrap();
            let (status, _, body) = self.send(req).await;
            (status, body)
        }

        /// Submits an intent and returns its id.
        async fn submit(&self, reference: &str, amount: u128) -> String {
            let req = self.intent_request(
                "/api/v1/intents",
                &intent_body(reference, amount),
                Some(&format!("key-{reference}")),
            );
            let (status, _, body) = self.send(req).await;
            assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
            let accepted: IntentAccepted = serde_json::from_slice(&body).unwrap();
            accepted.intent_id
        }

        fn count(&self, vec: &prometheus::IntCounterVec, label: &str) -> u64 {
            vec.with_label_values(&[label]).get()
        }
    }

    fn intent_body(reference: &str, amount: u128) -> serde_json::Value {
        serde_json::json!({
            "depositor": DEPOSITOR,
            "amount": amount.to_string(),
            "marketCode": "X",
            "paymentReference": reference,
        })
    }

    fn notification_body(intent_id: &str, reference: &str, amount: u128) -> serde_json::Value {
        serde_json::json!({
            "intentId": intent_id,
            "paymentReference": reference,
            "depositor": DEPOSITOR,
            "amount": amount.to_string(),
        })
    }

    fn error_of(body: &[u8]) -> ErrorResponse {
        serde_json::from_slice(body).unwrap()
    }

    // -- Submission -----------------------------------------------------------

    #[tokio::test]
    async fn submit_then_replay_returns_identical_response() {
        let app = test_app();
        let body = intent_body("ref-1", 1);

        let (status, headers, first) = app
            .send(app.intent_request("/api/v1/intents", &body, Some("idem-1")))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(headers.get(REPLAY_HEADER).is_none());
        let accepted: IntentAccepted = serde_json::from_slice(&first).unwrap();
        assert_eq!(accepted.status, "submitted");
        assert_eq!(
            app.escrow.get_status(&accepted.intent_id),
            Some(IntentStatus::Pending)
        );

        let (status, headers, second) = app
            .send(app.intent_request("/api/v1/intents", &body, Some("idem-1")))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers.get(REPLAY_HEADER).unwrap(), "true");
        assert_eq!(first, second);

        assert_eq!(app.escrow.intent_count(), 1);
        assert_eq!(app.escrow.assets().escrowed(), 1);
        assert_eq!(app.count(&app.metrics.intent_submissions_total, "accepted"), 1);
        assert_eq!(app.count(&app.metrics.intent_submissions_total, "replayed"), 1);
    }

    #[tokio::test]
    async fn submit_requires_idempotency_key() {
        let app = test_app();
        let req = app.intent_request("/api/v1/intents", &intent_body("ref-1", 1), None);
        let (status, _, body) = app.send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&body).error, "missing idempotency key");
        assert_eq!(app.escrow.intent_count(), 0);
    }

    #[tokio::test]
    async fn submit_rejects_settlement_namespaced_key() {
        let app = test_app();
        let req = app.intent_request(
            "/api/v1/intents",
            &intent_body("ref-1", 1),
            Some("settlement:ref-1"),
        );
        let (status, _, _) = app.send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_rejects_malformed_amount() {
        let app = test_app();
        for amount in ["", "-1", "0", "1.5", "ten"] {
            let body = serde_json::json!({
                "depositor": DEPOSITOR,
                "amount": amount,
                "marketCode": "X",
                "paymentReference": "ref-1",
            });
            let req = app.intent_request("/api/v1/intents", &body, Some("k"));
            let (status, _, _) = app.send(req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "amount {amount:?}");
        }
        assert_eq!(app.escrow.intent_count(), 0);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_before_the_handler() {
        let app = test_app();
        let mut req = app.intent_request("/api/v1/intents", &intent_body("ref-1", 1), Some("k"));
        req.headers_mut()
            .insert(INTENT_SIGNATURE_HEADER, HeaderValue::from_static("deadbeef"));
        let (status, _, _) = app.send(req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(app.escrow.intent_count(), 0);
        assert_eq!(app.count(&app.metrics.auth_failures_total, "intent"), 1);
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let app = test_app();
        let req = app.intent_request("/api/v1/intents", &intent_body("ref-1", 1), Some("k"));
        app.clock.advance(chrono::Duration::seconds(61));
        let (status, _, body) = app.send(req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error_of(&body).error, "stale request timestamp");
    }

    #[tokio::test]
    async fn channels_do_not_accept_each_others_signatures() {
        let app = test_app();
        let id = app.submit("ref-1", 1).await;
        let body = notification_body(&id, "ref-1", 1);
        let bytes = serde_json::to_vec(&body).unwrap();
        let ts = app.timestamp();
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/settlements")
            .header(
                SETTLEMENT_SIGNATURE_HEADER,
                mintbridge_protocol::auth::sign_payload(INTENT_SECRET, &ts, &bytes),
            )
            .header(SETTLEMENT_TIMESTAMP_HEADER, ts)
            .body(Body::from(bytes))
            .unwrap();
        let (status, _, _) = app.send(req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(app.ledger.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_reference_is_rejected_and_not_cached() {
        let app = test_app();
        app.submit("ref-1", 1).await;

        for _ in 0..2 {
            let req = app.intent_request(
                "/api/v1/intents",
                &intent_body("ref-1", 2),
                Some("other-key"),
            );
            let (status, headers, body) = app.send(req).await;
            assert_eq!(status, StatusCode::CONFLICT);
            assert!(headers.get(REPLAY_HEADER).is_none());
            assert_eq!(error_of(&body).kind, Some(ErrorKind::Conflict));
        }
        assert_eq!(app.idempotency.get("other-key").unwrap(), None);
        assert_eq!(app.escrow.assets().escrowed(), 1);
    }

    #[tokio::test]
    async fn concurrent_key_holder_gets_in_progress() {
        let app = test_app();
        assert_eq!(
            app.idempotency.claim("busy", Duration::from_secs(120)).unwrap(),
            Claim::Acquired
        );

        let req = app.intent_request("/api/v1/intents", &intent_body("ref-1", 1), Some("busy"));
        let (status, _, body) = app.send(req).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_of(&body).error, "request in progress");
        assert_eq!(app.escrow.intent_count(), 0);
    }

    #[tokio::test]
    async fn expired_outcome_re_executes() {
        let app = test_app();
        let body = intent_body("ref-1", 1);
        let (status, _, _) = app
            .send(app.intent_request("/api/v1/intents", &body, Some("idem-1")))
            .await;
        assert_eq!(status, StatusCode::CREATED);

        app.clock.advance(chrono::Duration::hours(25));
        let (status, headers, _) = app
            .send(app.intent_request("/api/v1/intents", &body, Some("idem-1")))
            .await;
        // The ledger runs again and refuses the consumed reference.
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(headers.get(REPLAY_HEADER).is_none());
    }

    // -- Settlement -----------------------------------------------------------

    #[tokio::test]
    async fn non_compliant_settlement_can_be_retried_after_update() {
        let app = test_app();
        let id = app.submit("ref-1", UNIT).await;
        let body = notification_body(&id, "ref-1", UNIT);

        let (status, _, resp) = app.send(app.settlement_request(&body)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_of(&resp).kind, Some(ErrorKind::Compliance));
        assert_eq!(app.escrow.get_status(&id), Some(IntentStatus::Pending));
        assert_eq!(app.dead_letters.depth(), 0);

        app.make_compliant(DEPOSITOR);
        let (status, _, resp) = app.send(app.settlement_request(&body)).await;
        assert_eq!(status, StatusCode::OK);
        let processed: SettlementProcessed = serde_json::from_slice(&resp).unwrap();
        assert_eq!(processed.status, "processed");
        assert_eq!(processed.intent_id, id);
        assert_eq!(app.escrow.get_status(&id), Some(IntentStatus::Executed));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_to_success() {
        let app = test_app();
        app.make_compliant(DEPOSITOR);
        let id = app.submit("ref-1", UNIT).await;
        app.ledger.failures.store(2, Ordering::SeqCst);

        let (status, _, resp) = app
            .send(app.settlement_request(&notification_body(&id, "ref-1", UNIT)))
            .await;

        assert_eq!(status, StatusCode::OK);
        let processed: SettlementProcessed = serde_json::from_slice(&resp).unwrap();
        assert!(processed.settlement_ref.starts_with("0x"));
        assert_eq!(app.ledger.executions.load(Ordering::SeqCst), 3);
        assert_eq!(app.dead_letters.depth(), 0);
        assert_eq!(app.count(&app.metrics.retry_attempts_total, "retry"), 2);
        assert_eq!(app.count(&app.metrics.retry_attempts_total, "success"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_settlement_is_dead_lettered() {
        let app = test_app();
        app.make_compliant(DEPOSITOR);
        let id = app.submit("ref-1", UNIT).await;
        app.ledger.failures.store(6, Ordering::SeqCst);
        let body = notification_body(&id, "ref-1", UNIT);

        let (status, _, resp) = app.send(app.settlement_request(&body)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let err = error_of(&resp);
        let dead_letter_id = err.dead_letter_id.unwrap();
        assert_eq!(app.ledger.executions.load(Ordering::SeqCst), 6);

        let entry = app.dead_letters.get(&dead_letter_id).unwrap().unwrap();
        assert_eq!(entry.payload, body);
        assert_eq!(entry.error, "transient ledger failure: connection refused");
        assert_eq!(entry.attempts, 6);
        assert_eq!(app.dead_letters.depth(), 1);
        assert_eq!(app.metrics.dead_letter_depth.get(), 1);
        assert_eq!(app.count(&app.metrics.retry_attempts_total, "failed"), 1);
        assert_eq!(
            app.count(&app.metrics.settlement_notifications_total, "dead_lettered"),
            1
        );
        assert_eq!(app.escrow.get_status(&id), Some(IntentStatus::Pending));
    }

    #[tokio::test]
    async fn processed_notification_is_replayed_without_executing() {
        let app = test_app();
        app.make_compliant(DEPOSITOR);
        let id = app.submit("ref-1", UNIT).await;
        let body = notification_body(&id, "ref-1", UNIT);

        let (_, _, first) = app.send(app.settlement_request(&body)).await;
        let (status, headers, second) = app.send(app.settlement_request(&body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(REPLAY_HEADER).unwrap(), "true");
        assert_eq!(first, second);
        assert_eq!(app.ledger.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn settlement_status_mapping() {
        let app = test_app();
        app.make_compliant(DEPOSITOR);

        let unknown = format!("0x{}", "ab".repeat(32));
        let (status, _, _) = app
            .send(app.settlement_request(&notification_body(&unknown, "ref-x", 1)))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = app
            .send(app.settlement_request(&notification_body("0x1234", "ref-y", 1)))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let id = app.submit("ref-1", 1).await;
        let (status, _, _) = app
            .send(app.settlement_request(&notification_body(&id, "ref-other", 1)))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(app.escrow.get_status(&id), Some(IntentStatus::Pending));
    }

    #[tokio::test]
    async fn daily_cap_surfaces_as_too_many_requests() {
        let app = test_app();
        app.make_compliant(DEPOSITOR);

        for i in 0..10 {
            let reference = format!("cap-{i}");
            let id = app.submit(&reference, UNIT).await;
            let (status, _, _) = app
                .send(app.settlement_request(&notification_body(&id, &reference, UNIT)))
                .await;
            assert_eq!(status, StatusCode::OK);
        }

        let id = app.submit("cap-10", UNIT).await;
        let (status, _, body) = app
            .send(app.settlement_request(&notification_body(&id, "cap-10", UNIT)))
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error_of(&body).kind, Some(ErrorKind::Capacity));
        assert_eq!(app.escrow.available_today(), 0);
        assert_eq!(app.dead_letters.depth(), 0);
    }

    // -- Query and refund -----------------------------------------------------

    #[tokio::test]
    async fn intent_query_returns_amount_as_string() {
        let app = test_app();
        let id = app.submit("ref-1", 5 * UNIT).await;

        let (status, body) = app.get(&format!("/api/v1/intents/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        let view: IntentView = serde_json::from_slice(&body).unwrap();
        assert_eq!(view.amount, "5000000000000000000");
        assert_eq!(view.status, IntentStatus::Pending);

        let missing = format!("0x{}", "00".repeat(32));
        let (status, _) = app.get(&format!("/api/v1/intents/{missing}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app.get("/api/v1/intents/not-an-id").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn refunded_intent_cannot_be_settled() {
        let app = test_app();
        app.make_compliant(DEPOSITOR);
        let id = app.submit("ref-1", UNIT).await;

        let refund = app.intent_request(
            &format!("/api/v1/intents/{id}/refund"),
            &serde_json::json!({ "reason": "payment expired" }),
            None,
        );
        let (status, _, body) = app.send(refund).await;
        assert_eq!(status, StatusCode::OK);
        let refunded: IntentRefunded = serde_json::from_slice(&body).unwrap();
        assert_eq!(refunded.status, "refunded");
        assert_eq!(app.escrow.assets().escrowed(), 0);

        let (status, _, _) = app
            .send(app.settlement_request(&notification_body(&id, "ref-1", UNIT)))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn refund_requires_reason_and_signature() {
        let app = test_app();
        let id = app.submit("ref-1", UNIT).await;
        let path = format!("/api/v1/intents/{id}/refund");

        let (status, _, _) = app
            .send(app.intent_request(&path, &serde_json::json!({ "reason": " " }), None))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unsigned = Request::builder()
            .method("POST")
            .uri(&path)
            .body(Body::from(r#"{"reason":"x"}"#))
            .unwrap();
        let (status, _, _) = app.send(unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(app.escrow.get_status(&id), Some(IntentStatus::Pending));
    }

    // -- Health, metrics, request ids -------------------------------------------

    #[tokio::test]
    async fn health_reports_dependencies() {
        let app = test_app();
        let (status, body) = app.get("/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "healthy");
        assert!(health.ledger.connected);
        assert!(health.database.connected);
        assert_eq!(health.queue_depth, 0);
    }

    #[tokio::test]
    async fn health_degrades_when_ledger_is_unreachable() {
        let app = test_app();
        app.ledger.down.store(true, Ordering::SeqCst);
        let (status, body) = app.get("/api/v1/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "degraded");
        assert!(!health.ledger.connected);
        assert_eq!(
            health.ledger.error.as_deref(),
            Some("transient ledger failure: ledger unreachable")
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_counters() {
        let app = test_app();
        app.submit("ref-1", 1).await;
        let (status, body) = app.get("/api/v1/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("mintbridge_intent_submissions_total{outcome=\"accepted\"} 1"));
        assert!(text.contains("mintbridge_dead_letter_depth 0"));
    }

    #[tokio::test]
    async fn request_id_is_assigned_or_propagated() {
        let app = test_app();
        let req = Request::builder()
            .uri("/api/v1/health")
            .body(Body::empty())
            .unwrap();
        let (_, headers, _) = app.send(req).await;
        assert!(!headers.get(REQUEST_ID_HEADER).unwrap().is_empty());

        let req = Request::builder()
            .uri("/api/v1/health")
            .header(REQUEST_ID_HEADER, "req-42")
            .body(Body::empty())
            .unwrap();
        let (_, headers, _) = app.send(req).await;
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-42");
    }
}
