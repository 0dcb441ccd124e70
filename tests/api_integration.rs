//! Integration tests for the HTTP surface.
//!
//! Each test builds the real router over an in-memory libSQL store with
//! stub LLM, calendar, and mailer backends, then drives it with
//! `tower::ServiceExt::oneshot`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, DurationRound, SecondsFormat, Utc};
use serde_json::Value;
use tower::ServiceExt;

use exec_assist::calendar::{BookingRequest, CalendarProvider};
use exec_assist::config::AssistantConfig;
use exec_assist::error::{CalendarError, DeliveryError, LlmError};
use exec_assist::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use exec_assist::mail::{Mailer, OutboundEmail};
use exec_assist::pipeline::types::TimeRange;
use exec_assist::pipeline::{ActivityRecorder, MeetingProcessor};
use exec_assist::store::LibSqlBackend;
use exec_assist::summary::SummaryService;
use exec_assist::web;

/// Stub LLM that always returns the same content.
struct StubLlm {
    content: String,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: self.content.clone(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Calendar where everyone is always free.
#[derive(Default)]
struct OpenCalendar {
    booked: Mutex<Vec<BookingRequest>>,
}

#[async_trait]
impl CalendarProvider for OpenCalendar {
    fn name(&self) -> &str {
        "open"
    }

    async fn free_busy(
        &self,
        _participants: &BTreeSet<String>,
        _window: &TimeRange,
    ) -> Result<BTreeMap<String, Vec<TimeRange>>, CalendarError> {
        Ok(BTreeMap::new())
    }

    async fn book(&self, request: &BookingRequest) -> Result<String, CalendarError> {
        self.booked.lock().unwrap().push(request.clone());
        Ok("evt-42".to_string())
    }
}

#[derive(Default)]
struct CollectingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
}

#[async_trait]
impl Mailer for CollectingMailer {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, DeliveryError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(format!("msg-{}", self.sent.lock().unwrap().len()))
    }
}

struct Harness {
    app: Router,
    calendar: Arc<OpenCalendar>,
    mailer: Arc<CollectingMailer>,
}

async fn harness(llm_content: String) -> Harness {
    let config = AssistantConfig {
        send_backoff_base: Duration::from_millis(1),
        ..AssistantConfig::default()
    };
    let llm: Arc<dyn LlmProvider> = Arc::new(StubLlm {
        content: llm_content,
    });
    let calendar = Arc::new(OpenCalendar::default());
    let mailer = Arc::new(CollectingMailer::default());
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let recorder = Arc::new(ActivityRecorder::new(store, config.store_attempts));
    let summary = Arc::new(SummaryService::new(
        Arc::clone(&recorder),
        Arc::clone(&llm),
        config.llm_timeout,
        config.business_hours.offset,
    ));
    let processor = Arc::new(MeetingProcessor::new(
        config,
        llm,
        calendar.clone(),
        mailer.clone(),
        recorder,
    ));
    Harness {
        app: web::routes(processor, summary),
        calendar,
        mailer,
    }
}

/// An hour-aligned window two days out, so it is never clipped by "now".
fn future_window() -> (DateTime<Utc>, DateTime<Utc>) {
    let start = (Utc::now() + chrono::Duration::days(2))
        .duration_trunc(chrono::Duration::hours(1))
        .unwrap();
    (start, start + chrono::Duration::hours(3))
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn confident_booking() -> String {
    let (start, end) = future_window();
    serde_json::json!({
        "is_meeting_request": true,
        "participants": ["bob@example.com"],
        "duration_minutes": 60,
        "preferred_windows": [{"start": rfc3339(start), "end": rfc3339(end)}],
        "confidence": 0.95,
        "auto_book": true,
        "subject": "Budget review"
    })
    .to_string()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn meeting_email() -> Value {
    serde_json::json!({
        "id": "msg-1",
        "sender": "Alice <alice@example.com>",
        "subject": "Budget review",
        "body": "Can we meet for an hour? Any time in that window works, just book it."
    })
}

#[tokio::test]
async fn health_ok() {
    let h = harness(confident_booking()).await;
    let (status, json) = send(&h.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "exec-assist");
}

#[tokio::test]
async fn process_books_and_replies() {
    let h = harness(confident_booking()).await;
    let (status, json) = send(&h.app, post_json("/api/process", meeting_email())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message_id"], "msg-1");
    assert_eq!(json["kind"], "book");
    assert_eq!(json["decision"]["kind"], "book");
    assert_eq!(json["booking_id"], "evt-42");
    assert_eq!(json["delivery_id"], "msg-1");
    assert_eq!(json["recorded"]["status"], "recorded");

    let (start, _) = future_window();
    let booked = h.calendar.booked.lock().unwrap();
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].range.start(), start);
    assert!(booked[0].participants.contains("alice@example.com"));

    let sent = h.mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "alice@example.com");
    assert_eq!(sent[0].in_reply_to.as_deref(), Some("<msg-1>"));
}

#[tokio::test]
async fn malformed_llm_output_asks_for_details() {
    let h = harness("I am not JSON".to_string()).await;
    let (status, json) = send(&h.app, post_json("/api/process", meeting_email())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["kind"], "clarify");
    assert_eq!(json["confidence"], 0.0);
    assert!(json["failure"].as_str().unwrap().contains("xtraction"));
    assert!(h.calendar.booked.lock().unwrap().is_empty());
}

#[tokio::test]
async fn process_raw_rejects_garbage() {
    let h = harness(confident_booking()).await;
    let req = Request::builder()
        .method("POST")
        .uri("/api/process/raw")
        .body(Body::from("no headers here"))
        .unwrap();
    let (status, json) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().is_some());
}

#[tokio::test]
async fn process_raw_parses_rfc822() {
    let h = harness(confident_booking()).await;
    let raw = "From: Alice <alice@example.com>\r\n\
               To: exec@example.com\r\n\
               Subject: Budget review\r\n\
               Message-ID: <raw-1@example.com>\r\n\
               Date: Tue, 10 Jun 2025 09:00:00 +0000\r\n\
               \r\n\
               Can we meet for an hour?\r\n";
    let req = Request::builder()
        .method("POST")
        .uri("/api/process/raw")
        .body(Body::from(raw))
        .unwrap();
    let (status, json) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["kind"], "book");
    assert_eq!(h.mailer.sent.lock().unwrap()[0].to, "alice@example.com");
}

#[tokio::test]
async fn batch_processes_every_message() {
    let h = harness(confident_booking()).await;
    let mut second = meeting_email();
    second["id"] = Value::from("msg-2");
    let (status, json) = send(
        &h.app,
        post_json("/api/process/batch", Value::Array(vec![meeting_email(), second])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let outcomes = json.as_array().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o["recorded"]["status"] == "recorded"));
}

#[tokio::test]
async fn activities_lists_recent_and_ranges() {
    let h = harness(confident_booking()).await;
    send(&h.app, post_json("/api/process", meeting_email())).await;

    let (status, json) = send(&h.app, get("/api/activities?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    let records = json.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["kind"], "book");
    assert_eq!(records[0]["message"]["id"], "msg-1");

    let from = rfc3339(Utc::now() - chrono::Duration::hours(1));
    let to = rfc3339(Utc::now() + chrono::Duration::hours(1));
    let (status, json) = send(
        &h.app,
        get(&format!("/api/activities?from={from}&to={to}&kind=book")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 1);

    let (status, json) = send(
        &h.app,
        get(&format!("/api/activities?from={from}&to={to}&kind=decline")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json.as_array().unwrap().is_empty());

    let (status, _) = send(&h.app, get(&format!("/api/activities?from={from}"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn summary_counts_the_day() {
    let h = harness(confident_booking()).await;
    send(&h.app, post_json("/api/process", meeting_email())).await;

    let today = Utc::now().date_naive();
    let (status, json) = send(&h.app, get(&format!("/api/summary/daily?date={today}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["date"], today.to_string());
    assert_eq!(json["total"], 1);
    assert_eq!(json["counts"]["book"], 1);
    assert_eq!(json["booked"].as_array().unwrap().len(), 1);
    assert!(json["text"].as_str().is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn availability_previews_slots() {
    let h = harness(confident_booking()).await;
    let (start, end) = future_window();
    let uri = format!(
        "/api/availability?duration=60&participants=bob@example.com,carol@example.com&from={}&to={}",
        rfc3339(start),
        rfc3339(end)
    );
    let (status, json) = send(&h.app, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["duration_minutes"], 60);
    let slots = json["slots"].as_array().unwrap();
    assert!(!slots.is_empty());
    assert!(slots.len() <= 5);
    let attendees = slots[0]["attendees_free"].as_array().unwrap();
    assert!(attendees.contains(&Value::from("carol@example.com")));
}

#[tokio::test]
async fn availability_rejects_bad_participant() {
    let h = harness(confident_booking()).await;
    let (status, json) = send(&h.app, get("/api/availability?participants=not-an-address")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("not-an-address"));

    let (status, _) = send(&h.app, get("/api/availability?duration=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn availability_rejects_multi_year_range() {
    let h = harness(confident_booking()).await;
    let from = rfc3339(Utc::now() + chrono::Duration::days(1));
    let to = rfc3339(Utc::now() + chrono::Duration::days(3 * 365));
    let (status, json) = send(
        &h.app,
        get(&format!("/api/availability?duration=60&from={from}&to={to}")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("at most 60 days"));
}

#[tokio::test]
async fn bulk_mail_is_recorded_without_reply() {
    let h = harness(confident_booking()).await;
    let newsletter = serde_json::json!({
        "id": "digest-1",
        "sender": "Shop <noreply@shop.example.com>",
        "subject": "Deals of the week",
        "body": "Let's meet our new range! Click here to unsubscribe."
    });
    let (status, json) = send(&h.app, post_json("/api/process", newsletter)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["kind"], "ignored");
    assert!(json["decision"].is_null());
    assert_eq!(json["classification"]["category"], "update");
    assert_eq!(json["classification"]["rule"], "noreply sender");
    assert!(h.mailer.sent.lock().unwrap().is_empty());
    assert!(h.calendar.booked.lock().unwrap().is_empty());

    let today = Utc::now().date_naive();
    let (_, summary) = send(&h.app, get(&format!("/api/summary/daily?date={today}"))).await;
    assert_eq!(summary["total"], 1);
    assert_eq!(summary["meeting_requests"], 0);
    assert_eq!(summary["counts"]["ignored"], 1);
    assert_eq!(summary["priorities"]["low"], 1);
}
