//! HTTP surface: process messages, read the activity log, preview
//! availability, and fetch the daily summary.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Error, PipelineError};
use crate::mail::parse_rfc822;
use crate::pipeline::processor::{MeetingProcessor, ProcessingOutcome};
use crate::pipeline::recorder::RecordStatus;
use crate::pipeline::types::{
    ActivityRecord, AvailabilitySlot, Classification, DEFAULT_DURATION_MINUTES, Decision,
    MeetingIntent, RawMessage, RecordKind, TimeRange, extract_address, is_valid_address,
};
use crate::store::ActivityFilter;
use crate::summary::{DailySummary, SummaryService};

/// Default page size for `/api/activities` without a range.
const DEFAULT_ACTIVITY_LIMIT: usize = 20;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<MeetingProcessor>,
    pub summary: Arc<SummaryService>,
}

/// Build the Axum router with every API route and permissive CORS.
pub fn routes(processor: Arc<MeetingProcessor>, summary: Arc<SummaryService>) -> Router {
    let state = AppState { processor, summary };

    Router::new()
        .route("/health", get(health))
        .route("/api/process", post(process_message))
        .route("/api/process/raw", post(process_raw))
        .route("/api/process/batch", post(process_batch))
        .route("/api/summary/daily", get(daily_summary))
        .route("/api/activities", get(list_activities))
        .route("/api/availability", get(availability))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Handler failure: a caller mistake, or a crate error mapped to a status.
enum ApiError {
    BadRequest(String),
    Internal(Error),
}

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self::Internal(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal(e) => {
                let status = match &e {
                    Error::Pipeline(PipelineError::CalendarUnavailable(_)) | Error::Calendar(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                error!(error = %e, status = status.as_u16(), "API request failed");
                (status, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError::BadRequest(message.into())
}

/// Both ends or neither; one alone is a caller mistake.
fn optional_range(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<Option<TimeRange>, ApiError> {
    match (from, to) {
        (Some(from), Some(to)) => TimeRange::new(from, to)
            .map(Some)
            .map_err(|e| bad_request(e.to_string())),
        (None, None) => Ok(None),
        _ => Err(bad_request("Both 'from' and 'to' are required")),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "exec-assist"
    }))
}

// ── Processing ──────────────────────────────────────────────────────────

/// JSON form of an inbound email. `id` and `received_at` are optional.
#[derive(Debug, Deserialize)]
struct ProcessRequest {
    #[serde(default)]
    id: Option<String>,
    sender: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
}

impl ProcessRequest {
    fn into_message(self) -> RawMessage {
        let message = RawMessage::new(
            self.sender,
            self.subject,
            self.body,
            self.received_at.unwrap_or_else(Utc::now),
        );
        match self.id {
            Some(id) if !id.trim().is_empty() => message.with_id(id),
            _ => message,
        }
    }
}

/// Decision-shaped view of a processing outcome.
#[derive(Debug, Serialize)]
struct ProcessResponse {
    record_id: Uuid,
    message_id: String,
    kind: RecordKind,
    confidence: f64,
    decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    classification: Option<Classification>,
    failure: Option<String>,
    booking_id: Option<String>,
    delivery_id: Option<String>,
    recorded: RecordStatus,
}

impl From<ProcessingOutcome> for ProcessResponse {
    fn from(outcome: ProcessingOutcome) -> Self {
        let record = outcome.record;
        Self {
            record_id: record.id,
            message_id: record.message.id,
            kind: record.kind,
            confidence: record.intent.confidence,
            decision: record.decision,
            classification: record.classification,
            failure: record.failure,
            booking_id: record.booking_id,
            delivery_id: record.delivery_id,
            recorded: outcome.recorded,
        }
    }
}

async fn process_message(
    State(state): State<AppState>,
    Json(body): Json<ProcessRequest>,
) -> impl IntoResponse {
    let message = body.into_message();
    info!(id = %message.id, "Processing message from API");
    let outcome = state.processor.process(message).await;
    (StatusCode::OK, Json(ProcessResponse::from(outcome)))
}

async fn process_raw(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ProcessResponse>, ApiError> {
    let Some(message) = parse_rfc822(&body) else {
        warn!(bytes = body.len(), "Rejected unparseable RFC 822 message");
        return Err(bad_request("Could not parse message or missing From header"));
    };
    let outcome = state.processor.process(message).await;
    Ok(Json(ProcessResponse::from(outcome)))
}

async fn process_batch(
    State(state): State<AppState>,
    Json(body): Json<Vec<ProcessRequest>>,
) -> impl IntoResponse {
    let messages: Vec<RawMessage> = body.into_iter().map(ProcessRequest::into_message).collect();
    let outcomes = state.processor.process_batch(messages).await;
    let responses: Vec<ProcessResponse> = outcomes.into_iter().map(ProcessResponse::from).collect();
    Json(responses)
}

// ── Summary ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    date: Option<NaiveDate>,
}

async fn daily_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<DailySummary>, ApiError> {
    let date = query
        .date
        .unwrap_or_else(|| state.summary.local_date(Utc::now()));
    Ok(Json(state.summary.daily(date).await?))
}

// ── Activities ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    limit: Option<usize>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    kind: Option<RecordKind>,
    sender: Option<String>,
}

async fn list_activities(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityRecord>>, ApiError> {
    let recorder = state.processor.recorder();
    let records = match optional_range(query.from, query.to)? {
        Some(range) => {
            let filter = ActivityFilter {
                kind: query.kind,
                sender: query.sender.as_deref().map(extract_address),
                limit: query.limit,
            };
            recorder.list(&range, &filter).await?
        }
        None => {
            recorder
                .recent(query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT))
                .await?
        }
    };
    Ok(Json(records))
}

// ── Availability ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AvailabilityQuery {
    duration: Option<u32>,
    /// Comma-separated addresses.
    #[serde(default)]
    participants: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct AvailabilityResponse {
    duration_minutes: u32,
    slots: Vec<AvailabilitySlot>,
}

async fn availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let duration = query.duration.unwrap_or(DEFAULT_DURATION_MINUTES);
    if duration == 0 {
        return Err(bad_request("duration must be positive"));
    }

    let mut participants = BTreeSet::new();
    for raw in query.participants.split(',').filter(|p| !p.trim().is_empty()) {
        let address = extract_address(raw);
        if !is_valid_address(&address) {
            return Err(bad_request(format!(
                "invalid participant address '{}'",
                raw.trim()
            )));
        }
        participants.insert(address);
    }

    let mut intent = MeetingIntent::unresolved("");
    intent.participants = participants;
    intent.duration_minutes = duration;
    let resolver = state.processor.resolver();
    let window = optional_range(query.from, query.to)?;
    if let Some(window) = &window
        && window.duration() > resolver.max_search_span()
    {
        return Err(bad_request(format!(
            "availability range may span at most {} days",
            resolver.max_search_span().num_days()
        )));
    }
    intent.preferred_windows = window.into_iter().collect();
    intent.confidence = 1.0;

    let slots = resolver.resolve(&intent, Utc::now()).await?;
    Ok(Json(AvailabilityResponse {
        duration_minutes: duration,
        slots,
    }))
}
