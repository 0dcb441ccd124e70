//! Email processor: runs one inbound email through every stage and
//! records the outcome.
//!
//! Flow:
//! 1. Normalize → classify → route
//! 2. Meeting requests: extract intent, check constraints, resolve
//!    free/busy (skipped at low confidence)
//! 3. Decide → book (with a last-moment free/busy re-check)
//! 4. Draft + send the reply (bounded retries)
//! 5. Append the activity record
//!
//! Urgent mail is flagged, auto-respondable mail gets a short
//! acknowledgement and bulk mail is recorded without a reply.
//!
//! `process` never returns an error. Every failure is folded into the
//! decision or the record so each message leaves exactly one audit entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::calendar::{BookingRequest, CalendarProvider};
use crate::config::AssistantConfig;
use crate::error::PipelineError;
use crate::llm::provider::LlmProvider;
use crate::mail::{Mailer, OutboundEmail};
use crate::pipeline::decision::{Availability, DecisionEngine};
use crate::pipeline::extract::IntentExtractor;
use crate::pipeline::normalize::normalize;
use crate::pipeline::recorder::{ActivityRecorder, RecordStatus};
use crate::pipeline::resolver::AvailabilityResolver;
use crate::pipeline::retry::{RetryPolicy, retry};
use crate::pipeline::triage::{AutoResponder, EmailClassifier, Route, TriageRules, route};
use crate::pipeline::types::{
    ActivityRecord, Classification, Decision, DecisionKind, MeetingIntent, RawMessage,
    RecordKind, TimeRange, is_valid_address,
};

/// Result of processing one message.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingOutcome {
    pub record: ActivityRecord,
    pub recorded: RecordStatus,
    /// Stage failures absorbed along the way, in order.
    #[serde(skip)]
    pub errors: Vec<PipelineError>,
}

impl ProcessingOutcome {
    pub fn decision(&self) -> Option<&Decision> {
        self.record.decision.as_ref()
    }
}

/// Orchestrates the inbound email pipeline.
pub struct MeetingProcessor {
    config: AssistantConfig,
    classifier: EmailClassifier,
    responder: AutoResponder,
    extractor: IntentExtractor,
    resolver: AvailabilityResolver,
    engine: DecisionEngine,
    calendar: Arc<dyn CalendarProvider>,
    mailer: Arc<dyn Mailer>,
    recorder: Arc<ActivityRecorder>,
    send_policy: RetryPolicy,
}

impl MeetingProcessor {
    pub fn new(
        config: AssistantConfig,
        llm: Arc<dyn LlmProvider>,
        calendar: Arc<dyn CalendarProvider>,
        mailer: Arc<dyn Mailer>,
        recorder: Arc<ActivityRecorder>,
    ) -> Self {
        Self::with_rules(config, TriageRules::default(), llm, calendar, mailer, recorder)
    }

    /// Like `new`, with a custom rule set in front of the classifier.
    pub fn with_rules(
        config: AssistantConfig,
        rules: TriageRules,
        llm: Arc<dyn LlmProvider>,
        calendar: Arc<dyn CalendarProvider>,
        mailer: Arc<dyn Mailer>,
        recorder: Arc<ActivityRecorder>,
    ) -> Self {
        Self {
            classifier: EmailClassifier::new(rules, Arc::clone(&llm), config.llm_timeout),
            responder: AutoResponder::new(Arc::clone(&llm), config.llm_timeout),
            extractor: IntentExtractor::new(llm, config.llm_timeout, config.high_threshold),
            resolver: AvailabilityResolver::new(Arc::clone(&calendar), &config),
            engine: DecisionEngine::new(&config),
            send_policy: RetryPolicy::new(config.send_attempts, config.send_backoff_base),
            config,
            calendar,
            mailer,
            recorder,
        }
    }

    pub fn resolver(&self) -> &AvailabilityResolver {
        &self.resolver
    }

    pub fn recorder(&self) -> &Arc<ActivityRecorder> {
        &self.recorder
    }

    /// Process a single message against the current time.
    pub async fn process(&self, message: RawMessage) -> ProcessingOutcome {
        self.process_at(message, Utc::now()).await
    }

    /// Process a single message with an explicit "now" for slot search.
    pub async fn process_at(&self, message: RawMessage, now: DateTime<Utc>) -> ProcessingOutcome {
        let sender = message.sender_address();
        info!(id = %message.id, sender = %sender, "Processing email");

        let mut errors = Vec::new();

        // Step 1: Normalize + triage
        let text = normalize(&message, self.config.max_text_chars);
        let triage = self.classifier.classify(&message, &text).await;
        errors.extend(triage.failure);
        let classification = triage.classification;

        // Step 2: Route
        let record = match route(&classification) {
            Route::Meeting => {
                let mut record = self.schedule(message, &text, &sender, now, &mut errors).await;
                record.classification = Some(classification);
                record
            }
            Route::Urgent => self.flag_urgent(message, classification, &mut errors).await,
            Route::AutoReply => {
                self.auto_reply(message, &text, &sender, classification, &mut errors)
                    .await
            }
            Route::Ignore => {
                info!(id = %message.id, rule = ?classification.rule, "Ignoring bulk email");
                ActivityRecord::triaged(message, classification, RecordKind::Ignored)
            }
            Route::Note => ActivityRecord::triaged(message, classification, RecordKind::Noted),
        };

        // Step 3: Record
        let recorded = self.recorder.record(&record).await;
        if let RecordStatus::Unrecorded { attempts, reason } = &recorded {
            errors.push(PipelineError::StoreWriteFailure {
                attempts: *attempts,
                reason: reason.clone(),
            });
        }

        info!(
            id = %record.message.id,
            kind = record.kind.as_str(),
            priority = record.priority().as_str(),
            recorded = recorded.is_recorded(),
            "Email processed"
        );
        ProcessingOutcome {
            record,
            recorded,
            errors,
        }
    }

    /// Meeting-request path: extract, check availability, decide, book, reply.
    async fn schedule(
        &self,
        message: RawMessage,
        text: &str,
        sender: &str,
        now: DateTime<Utc>,
        errors: &mut Vec<PipelineError>,
    ) -> ActivityRecord {
        let extraction = self
            .extractor
            .extract(text, sender, message.received_at)
            .await;
        let extraction_failure = extraction.failure.as_ref().map(ToString::to_string);
        errors.extend(extraction.failure);
        let intent = extraction.intent;

        let availability = self.availability(&intent, now, errors).await;

        let mut decision = self.engine.decide(&intent, &availability);
        let mut booking_id = None;
        if decision.kind == DecisionKind::Book
            && let Some(slot) = decision.chosen_slot
        {
            match self.book(&intent, &slot, sender).await {
                Ok(id) => booking_id = Some(id),
                Err(e) => {
                    warn!(id = %message.id, error = %e, "Booking failed, asking sender instead");
                    decision = self
                        .engine
                        .decide(&intent, &Availability::CalendarUnavailable(e.to_string()));
                    errors.push(e);
                }
            }
        }

        let mut email = self.engine.draft_reply(&intent, &decision, sender);
        email.in_reply_to = Some(thread_reference(&message.id));
        let delivery = self.deliver(&email, sender).await;

        let mut record = match &delivery {
            Ok(_) => ActivityRecord::completed(message, intent, decision),
            Err(e) => ActivityRecord::failed(message, intent, Some(decision), e.to_string()),
        };
        if record.failure.is_none() {
            record.failure = extraction_failure;
        }
        record.booking_id = booking_id;
        match delivery {
            Ok(id) => record.delivery_id = Some(id),
            Err(e) => errors.push(e),
        }
        record
    }

    /// Urgent mail is logged, recorded and, when configured, forwarded as an
    /// alert to the executive.
    async fn flag_urgent(
        &self,
        message: RawMessage,
        classification: Classification,
        errors: &mut Vec<PipelineError>,
    ) -> ActivityRecord {
        warn!(
            id = %message.id,
            sender = %message.sender_address(),
            subject = %message.subject,
            action_items = classification.action_items.len(),
            "Urgent email needs attention"
        );
        let alert = self
            .config
            .urgent_recipient
            .as_ref()
            .map(|to| (to.clone(), urgent_alert(&message, &classification, to)));
        let mut record = ActivityRecord::triaged(message, classification, RecordKind::Urgent);
        if let Some((to, alert)) = alert {
            match self.deliver(&alert, &to).await {
                Ok(id) => record.delivery_id = Some(id),
                Err(e) => {
                    record.kind = RecordKind::Failed;
                    record.failure = Some(e.to_string());
                    errors.push(e);
                }
            }
        }
        record
    }

    async fn auto_reply(
        &self,
        message: RawMessage,
        text: &str,
        sender: &str,
        classification: Classification,
        errors: &mut Vec<PipelineError>,
    ) -> ActivityRecord {
        let body = self.responder.draft(text, &classification).await;
        let email = OutboundEmail {
            to: sender.to_string(),
            subject: reply_subject(&message.subject),
            body,
            in_reply_to: Some(thread_reference(&message.id)),
        };
        let delivery = self.deliver(&email, sender).await;

        let mut record = ActivityRecord::triaged(message, classification, RecordKind::AutoReply);
        match delivery {
            Ok(id) => {
                info!(id = %record.message.id, to = %sender, "Auto-reply sent");
                record.delivery_id = Some(id);
            }
            Err(e) => {
                record.kind = RecordKind::Failed;
                record.failure = Some(e.to_string());
                errors.push(e);
            }
        }
        record
    }

    /// Process messages concurrently, at most `max_concurrency` at a time.
    /// Outcomes arrive in completion order.
    pub async fn process_batch(&self, messages: Vec<RawMessage>) -> Vec<ProcessingOutcome> {
        let count = messages.len();
        info!(count, "Processing message batch");

        let outcomes: Vec<ProcessingOutcome> = futures::stream::iter(messages)
            .map(|m| self.process(m))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        info!(
            processed = outcomes.len(),
            recorded = outcomes.iter().filter(|o| o.recorded.is_recorded()).count(),
            "Batch complete"
        );
        outcomes
    }

    async fn availability(
        &self,
        intent: &MeetingIntent,
        now: DateTime<Utc>,
        errors: &mut Vec<PipelineError>,
    ) -> Availability {
        if intent.confidence < self.config.low_threshold {
            return Availability::NotChecked;
        }
        if let Err(e) = self.engine.check_constraints(intent) {
            let availability = Availability::from_resolution(Err(e.clone()));
            errors.push(e);
            return availability;
        }
        let resolution = self.resolver.resolve(intent, now).await;
        if let Err(e) = &resolution {
            errors.push(e.clone());
        }
        Availability::from_resolution(resolution)
    }

    /// Re-check then book. Any conflict or calendar failure is reported as
    /// `CalendarUnavailable`.
    async fn book(
        &self,
        intent: &MeetingIntent,
        slot: &TimeRange,
        sender: &str,
    ) -> Result<String, PipelineError> {
        if !self.resolver.verify_free(&intent.participants, slot).await? {
            return Err(PipelineError::CalendarUnavailable(format!(
                "{slot} was taken before it could be booked"
            )));
        }

        let request = BookingRequest {
            participants: intent.participants.clone(),
            range: *slot,
            subject: intent.title().to_string(),
            description: booking_description(intent, sender),
        };
        let timeout = self.resolver.timeout();
        match tokio::time::timeout(timeout, self.calendar.book(&request)).await {
            Ok(Ok(id)) => {
                info!(booking_id = %id, slot = %slot, "Meeting booked");
                Ok(id)
            }
            Ok(Err(e)) => Err(PipelineError::CalendarUnavailable(e.to_string())),
            Err(_) => Err(PipelineError::CalendarUnavailable(format!(
                "booking timed out after {timeout:?}"
            ))),
        }
    }

    async fn deliver(
        &self,
        email: &OutboundEmail,
        recipient: &str,
    ) -> Result<String, PipelineError> {
        if !is_valid_address(recipient) {
            return Err(PipelineError::DeliveryFailure {
                attempts: 0,
                reason: format!("address '{recipient}' is not deliverable"),
            });
        }
        retry(&self.send_policy, "send_reply", || self.mailer.send(email))
            .await
            .map_err(|exhausted| PipelineError::DeliveryFailure {
                attempts: exhausted.attempts,
                reason: exhausted.last_error.to_string(),
            })
    }
}

fn booking_description(intent: &MeetingIntent, sender: &str) -> String {
    let mut description = format!("Requested by {sender}.");
    if !intent.agenda_items.is_empty() {
        description.push_str("\n\nAgenda:\n");
        for item in &intent.agenda_items {
            description.push_str(&format!("- {item}\n"));
        }
    }
    description
}

fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        subject.to_string()
    } else if subject.is_empty() {
        "Re: your email".to_string()
    } else {
        format!("Re: {subject}")
    }
}

fn urgent_alert(message: &RawMessage, classification: &Classification, to: &str) -> OutboundEmail {
    let mut body = format!(
        "Urgent email from {} received {}.\n\nSubject: {}\n",
        message.sender,
        message.received_at.format("%Y-%m-%d %H:%M UTC"),
        message.subject
    );
    if !classification.key_topics.is_empty() {
        body.push_str(&format!("Topics: {}\n", classification.key_topics.join(", ")));
    }
    if !classification.action_items.is_empty() {
        body.push_str("\nAction items:\n");
        for item in &classification.action_items {
            body.push_str(&format!("- {item}\n"));
        }
    }
    OutboundEmail {
        to: to.to_string(),
        subject: format!("[Urgent] {}", message.subject.trim()),
        body,
        in_reply_to: None,
    }
}

/// `In-Reply-To` value for a message id.
fn thread_reference(id: &str) -> String {
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::error::{CalendarError, DeliveryError, LlmError};
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason};
    use crate::pipeline::triage::RuleField;
    use crate::pipeline::types::{EmailCategory, Priority};
    use crate::store::{ActivityStore, LibSqlBackend};

    // ── Mocks ───────────────────────────────────────────────────────

    /// Answers extraction with `response`, classification with
    /// `classification` (or `response` when unset) and drafts with a fixed
    /// acknowledgement.
    struct FixedLlm {
        response: String,
        classification: Option<String>,
    }

    #[async_trait]
    impl LlmProvider for FixedLlm {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let system = request.messages.first().map(|m| m.content.as_str()).unwrap_or("");
            let content = if system.contains("Classify the email") {
                self.classification.clone().unwrap_or_else(|| self.response.clone())
            } else if system.contains("acknowledgement") {
                "Thanks for the note, the report arrived safely.".to_string()
            } else {
                self.response.clone()
            };
            Ok(CompletionResponse {
                content,
                input_tokens: 100,
                output_tokens: 50,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    #[derive(Default)]
    struct FakeCalendar {
        busy: Vec<TimeRange>,
        /// Busy ranges that appear only after the first free/busy call.
        late_busy: Vec<TimeRange>,
        fail_book: bool,
        free_busy_calls: AtomicUsize,
        booked: Mutex<Vec<BookingRequest>>,
    }

    #[async_trait]
    impl CalendarProvider for FakeCalendar {
        fn name(&self) -> &str {
            "fake"
        }

        async fn free_busy(
            &self,
            participants: &BTreeSet<String>,
            _window: &TimeRange,
        ) -> Result<BTreeMap<String, Vec<TimeRange>>, CalendarError> {
            let n = self.free_busy_calls.fetch_add(1, Ordering::SeqCst);
            let mut busy = self.busy.clone();
            if n > 0 {
                busy.extend(self.late_busy.iter().copied());
            }
            let mut out = BTreeMap::new();
            if let Some(first) = participants.iter().next() {
                out.insert(first.clone(), busy);
            }
            Ok(out)
        }

        async fn book(&self, request: &BookingRequest) -> Result<String, CalendarError> {
            if self.fail_book {
                return Err(CalendarError::RequestFailed {
                    provider: "fake".into(),
                    status: 500,
                    reason: "backend error".into(),
                });
            }
            self.booked.lock().unwrap().push(request.clone());
            Ok("evt-123".into())
        }
    }

    #[derive(Default)]
    struct FakeMailer {
        failures: u32,
        calls: AtomicU32,
        sent: Mutex<Vec<OutboundEmail>>,
    }

    #[async_trait]
    impl Mailer for FakeMailer {
        fn name(&self) -> &str {
            "fake"
        }

        async fn send(&self, email: &OutboundEmail) -> Result<String, DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(DeliveryError::SendFailed {
                    provider: "fake".into(),
                    reason: "503 service unavailable".into(),
                });
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(format!("delivery-{n}"))
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, h, m, 0).unwrap()
    }

    /// Monday 2026-10-12 08:00 UTC.
    fn now() -> DateTime<Utc> {
        at(12, 8, 0)
    }

    fn message() -> RawMessage {
        RawMessage::new(
            "Alice Smith <alice@example.com>",
            "Budget review",
            "Could we meet Tuesday between 2 and 5pm for an hour? Any time in that window works.",
            now(),
        )
        .with_id("msg-1@example.com")
    }

    const TUESDAY_HOUR: &str = r#"{
        "is_meeting_request": true,
        "participants": ["alice@example.com"],
        "duration_minutes": 60,
        "preferred_windows": [{"start": "2026-10-13T14:00:00Z", "end": "2026-10-13T17:00:00Z"}],
        "subject": "Budget review",
        "auto_book": true,
        "confidence": 0.9
    }"#;

    fn test_config() -> AssistantConfig {
        AssistantConfig {
            send_backoff_base: Duration::ZERO,
            ..AssistantConfig::default()
        }
    }

    struct Harness {
        processor: MeetingProcessor,
        calendar: Arc<FakeCalendar>,
        mailer: Arc<FakeMailer>,
        store: Arc<LibSqlBackend>,
    }

    async fn harness(llm_response: &str, calendar: FakeCalendar, mailer: FakeMailer) -> Harness {
        let llm = FixedLlm {
            response: llm_response.to_string(),
            classification: None,
        };
        harness_with(llm, test_config(), calendar, mailer).await
    }

    async fn harness_with(
        llm: FixedLlm,
        config: AssistantConfig,
        calendar: FakeCalendar,
        mailer: FakeMailer,
    ) -> Harness {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let calendar = Arc::new(calendar);
        let mailer = Arc::new(mailer);
        let recorder = Arc::new(ActivityRecorder::new(store.clone(), 3));
        let processor = MeetingProcessor::new(
            config,
            Arc::new(llm),
            calendar.clone(),
            mailer.clone(),
            recorder,
        );
        Harness {
            processor,
            calendar,
            mailer,
            store,
        }
    }

    // ── Scenarios ───────────────────────────────────────────────────

    #[tokio::test]
    async fn books_free_slot_inside_preferred_window() {
        let h = harness(TUESDAY_HOUR, FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        let decision = outcome.decision().unwrap();
        assert_eq!(decision.kind, DecisionKind::Book);
        assert_eq!(
            decision.chosen_slot,
            Some(TimeRange::new(at(13, 14, 0), at(13, 15, 0)).unwrap())
        );
        assert_eq!(outcome.record.kind, RecordKind::Book);
        assert_eq!(outcome.record.booking_id.as_deref(), Some("evt-123"));
        assert!(outcome.recorded.is_recorded());

        let booked = h.calendar.booked.lock().unwrap();
        assert_eq!(booked.len(), 1);
        assert_eq!(booked[0].subject, "Budget review");

        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent[0].to, "alice@example.com");
        assert_eq!(sent[0].in_reply_to.as_deref(), Some("<msg-1@example.com>"));

        let stored = h.store.get(outcome.record.id).await.unwrap().unwrap();
        assert_eq!(stored, outcome.record);
    }

    #[tokio::test]
    async fn no_slots_asks_for_other_times() {
        let calendar = FakeCalendar {
            busy: vec![TimeRange::new(at(13, 0, 0), at(14, 0, 0)).unwrap()],
            ..FakeCalendar::default()
        };
        let h = harness(TUESDAY_HOUR, calendar, FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        let decision = outcome.decision().unwrap();
        assert_eq!(decision.kind, DecisionKind::Clarify);
        assert!(decision.rationale.contains("no availability"));
        assert!(h.calendar.booked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlong_meeting_declines_without_calendar() {
        let llm = r#"{"is_meeting_request": true, "duration_minutes": 600, "confidence": 0.9}"#;
        let h = harness(llm, FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.decision().unwrap().kind, DecisionKind::Decline);
        assert_eq!(h.calendar.free_busy_calls.load(Ordering::SeqCst), 0);
        assert!(outcome
            .errors
            .iter()
            .any(|e| matches!(e, PipelineError::ContradictoryConstraints(_))));
    }

    #[tokio::test]
    async fn malformed_llm_output_clarifies() {
        let h = harness("I'm not sure what you mean", FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.intent.confidence, 0.0);
        assert_eq!(outcome.record.kind, RecordKind::Clarify);
        assert!(outcome.record.failure.is_some());
        assert_eq!(h.calendar.free_busy_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn late_conflict_turns_booking_into_clarify() {
        let calendar = FakeCalendar {
            late_busy: vec![TimeRange::new(at(13, 14, 0), at(13, 15, 0)).unwrap()],
            ..FakeCalendar::default()
        };
        let h = harness(TUESDAY_HOUR, calendar, FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        let decision = outcome.decision().unwrap();
        assert_eq!(decision.kind, DecisionKind::Clarify);
        assert!(decision.rationale.starts_with("Apologies"));
        assert!(outcome.record.booking_id.is_none());
        assert!(h.calendar.booked.lock().unwrap().is_empty());
        assert!(outcome
            .errors
            .iter()
            .any(|e| matches!(e, PipelineError::CalendarUnavailable(_))));
    }

    #[tokio::test]
    async fn booking_error_turns_into_clarify() {
        let calendar = FakeCalendar {
            fail_book: true,
            ..FakeCalendar::default()
        };
        let h = harness(TUESDAY_HOUR, calendar, FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;
        assert_eq!(outcome.record.kind, RecordKind::Clarify);
    }

    #[tokio::test]
    async fn transient_send_failure_is_retried() {
        let mailer = FakeMailer {
            failures: 2,
            ..FakeMailer::default()
        };
        let h = harness(TUESDAY_HOUR, FakeCalendar::default(), mailer).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Book);
        assert_eq!(outcome.record.delivery_id.as_deref(), Some("delivery-2"));
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_send_records_failed_with_decision() {
        let mailer = FakeMailer {
            failures: 10,
            ..FakeMailer::default()
        };
        let h = harness(TUESDAY_HOUR, FakeCalendar::default(), mailer).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Failed);
        assert_eq!(outcome.decision().unwrap().kind, DecisionKind::Book);
        assert!(outcome.record.failure.as_ref().unwrap().contains("Delivery failed"));
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 3);
        assert!(h.store.get(outcome.record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mid_confidence_proposes() {
        let llm = TUESDAY_HOUR.replace("0.9", "0.6");
        let h = harness(&llm, FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        let decision = outcome.decision().unwrap();
        assert_eq!(decision.kind, DecisionKind::Propose);
        assert_eq!(decision.alternative_slots.len(), 5);
        assert!(h.calendar.booked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_records_every_message() {
        let h = harness(TUESDAY_HOUR, FakeCalendar::default(), FakeMailer::default()).await;
        let messages: Vec<RawMessage> = (0..6)
            .map(|i| {
                RawMessage::new(
                    format!("user{i}@example.com"),
                    "Sync",
                    "Tuesday afternoon?",
                    Utc::now(),
                )
            })
            .collect();

        let outcomes = h.processor.process_batch(messages).await;
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.recorded.is_recorded()));
        assert_eq!(h.store.recent(10).await.unwrap().len(), 6);
    }

    fn classified(classification: &str) -> FixedLlm {
        FixedLlm {
            response: TUESDAY_HOUR.to_string(),
            classification: Some(classification.to_string()),
        }
    }

    #[tokio::test]
    async fn meeting_classification_still_books() {
        let llm = classified(r#"{"category": "meeting_request", "priority": "medium"}"#);
        let h = harness_with(llm, test_config(), FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Book);
        assert_eq!(
            outcome.record.classification.as_ref().unwrap().category,
            EmailCategory::MeetingRequest
        );
        assert!(outcome.errors.is_empty());
        assert_eq!(h.calendar.booked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bulk_sender_is_ignored_without_reply() {
        let h = harness(TUESDAY_HOUR, FakeCalendar::default(), FakeMailer::default()).await;
        let newsletter = RawMessage::new(
            "Weekly Digest <noreply@news.example.com>",
            "This week in scheduling",
            "Let's meet the new features. Click here to unsubscribe.",
            now(),
        );
        let outcome = h.processor.process_at(newsletter, now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Ignored);
        assert!(outcome.record.decision.is_none());
        assert!(outcome.recorded.is_recorded());
        assert_eq!(h.calendar.free_busy_calls.load(Ordering::SeqCst), 0);
        assert!(h.mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn newsletter_classification_is_ignored() {
        let llm = classified(r#"{"category": "newsletter", "priority": "low", "can_auto_respond": true}"#);
        let h = harness_with(llm, test_config(), FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Ignored);
        assert!(h.mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn urgent_mail_is_recorded_and_alerted() {
        let llm = classified(
            r#"{"category": "urgent_request", "priority": "high", "action_items": ["Sign the contract today"]}"#,
        );
        let config = AssistantConfig {
            urgent_recipient: Some("exec@example.com".into()),
            ..test_config()
        };
        let h = harness_with(llm, config, FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Urgent);
        assert_eq!(outcome.record.priority(), Priority::High);
        assert!(outcome.record.delivery_id.is_some());
        assert_eq!(h.calendar.free_busy_calls.load(Ordering::SeqCst), 0);

        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "exec@example.com");
        assert_eq!(sent[0].subject, "[Urgent] Budget review");
        assert!(sent[0].body.contains("- Sign the contract today"));
    }

    #[tokio::test]
    async fn urgent_mail_without_recipient_is_only_recorded() {
        let llm = classified(r#"{"category": "question", "priority": "high"}"#);
        let h = harness_with(llm, test_config(), FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Urgent);
        assert!(outcome.record.delivery_id.is_none());
        assert!(h.mailer.sent.lock().unwrap().is_empty());
        assert!(h.store.get(outcome.record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn auto_respondable_mail_gets_acknowledgement() {
        let llm = classified(
            r#"{"category": "update", "priority": "low", "can_auto_respond": true, "key_topics": ["report"]}"#,
        );
        let h = harness_with(llm, test_config(), FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::AutoReply);
        assert_eq!(outcome.record.delivery_id.as_deref(), Some("delivery-0"));
        assert!(h.calendar.booked.lock().unwrap().is_empty());

        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent[0].to, "alice@example.com");
        assert_eq!(sent[0].subject, "Re: Budget review");
        assert_eq!(sent[0].in_reply_to.as_deref(), Some("<msg-1@example.com>"));
        assert!(sent[0].body.contains("report arrived"));
    }

    #[tokio::test]
    async fn failed_auto_reply_is_recorded_as_failed() {
        let llm = classified(r#"{"category": "question", "priority": "low", "can_auto_respond": true}"#);
        let mailer = FakeMailer {
            failures: 10,
            ..FakeMailer::default()
        };
        let h = harness_with(llm, test_config(), FakeCalendar::default(), mailer).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Failed);
        assert!(outcome.record.classification.is_some());
        assert!(outcome
            .errors
            .iter()
            .any(|e| matches!(e, PipelineError::DeliveryFailure { .. })));
    }

    #[tokio::test]
    async fn informational_mail_is_noted() {
        let llm = classified(r#"{"category": "update", "priority": "low"}"#);
        let h = harness_with(llm, test_config(), FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Noted);
        assert!(h.mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_classification_falls_through_to_meeting() {
        let h = harness(TUESDAY_HOUR, FakeCalendar::default(), FakeMailer::default()).await;
        let outcome = h.processor.process_at(message(), now()).await;

        assert_eq!(outcome.record.kind, RecordKind::Book);
        assert!(matches!(
            outcome.errors[0],
            PipelineError::ClassificationFailure(_)
        ));
    }

    #[tokio::test]
    async fn custom_rule_short_circuits_classification() {
        let mut rules = TriageRules::default();
        rules
            .add_rule(r"(?i)^budget review$", RuleField::Subject, EmailCategory::Update, "budget noise")
            .unwrap();
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailer = Arc::new(FakeMailer::default());
        let processor = MeetingProcessor::with_rules(
            test_config(),
            rules,
            Arc::new(FixedLlm {
                response: TUESDAY_HOUR.to_string(),
                classification: None,
            }),
            Arc::new(FakeCalendar::default()),
            mailer.clone(),
            Arc::new(ActivityRecorder::new(store, 3)),
        );

        let outcome = processor.process_at(message(), now()).await;
        assert_eq!(outcome.record.kind, RecordKind::Ignored);
        assert_eq!(
            outcome.record.classification.unwrap().rule.as_deref(),
            Some("budget noise")
        );
        assert!(outcome.errors.is_empty());
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn reply_subject_keeps_existing_prefix() {
        assert_eq!(reply_subject("Report"), "Re: Report");
        assert_eq!(reply_subject("RE: Report"), "RE: Report");
        assert_eq!(reply_subject("  "), "Re: your email");
        assert_eq!(reply_subject("Ré"), "Re: Ré");
    }

    #[test]
    fn thread_reference_wraps_bare_ids() {
        assert_eq!(thread_reference("abc@x"), "<abc@x>");
        assert_eq!(thread_reference("<abc@x>"), "<abc@x>");
    }
}
