//! Daily activity summary for the executive.
//!
//! Counts the day's records by kind and priority, lists what got booked,
//! and asks the LLM for a short narrative. A deterministic text stands in when the LLM
//! is slow or fails. `spawn_summary_ticker` mails the summary on a cron
//! schedule.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::DatabaseError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::mail::{Mailer, OutboundEmail};
use crate::pipeline::recorder::ActivityRecorder;
use crate::pipeline::types::{ActivityRecord, Priority, RecordKind, TimeRange};
use crate::store::ActivityFilter;

/// Upper bound on the narrative length.
const MAX_NARRATIVE_WORDS: usize = 200;

/// How often the ticker wakes to compare the clock with the schedule.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

const SUMMARY_INSTRUCTION: &str = "\
You write a brief end-of-day summary for a busy executive about the email \
their assistant handled. Start with anything urgent, then say how many meetings \
were booked and their topics, what is still waiting on other people, what was \
answered automatically, and anything that failed. Plain prose, no headings, \
under 200 words.";

/// A meeting that was booked during the day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookedMeeting {
    pub subject: String,
    pub participants: BTreeSet<String>,
    pub slot: TimeRange,
    pub booking_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    /// Emails processed.
    pub total: u64,
    /// Emails that went through the meeting pipeline.
    pub meeting_requests: u64,
    /// Every kind appears, including zero counts.
    pub counts: BTreeMap<RecordKind, u64>,
    /// Every priority appears, including zero counts.
    pub priorities: BTreeMap<Priority, u64>,
    pub booked: Vec<BookedMeeting>,
    /// LLM narrative; `None` when the model failed or timed out.
    pub narrative: Option<String>,
    /// Narrative if present, otherwise the deterministic fallback.
    pub text: String,
}

impl DailySummary {
    /// Render the summary as an email to `recipient`.
    pub fn to_email(&self, recipient: &str) -> OutboundEmail {
        let mut body = self.text.clone();
        if !self.booked.is_empty() {
            body.push_str("\n\nBooked:\n");
            for meeting in &self.booked {
                body.push_str(&format!("- {} ({})\n", meeting.subject, meeting.slot));
            }
        }
        OutboundEmail {
            to: recipient.to_string(),
            subject: format!("Daily summary for {}", self.date.format("%A, %B %-d")),
            body,
            in_reply_to: None,
        }
    }
}

pub struct SummaryService {
    recorder: Arc<ActivityRecorder>,
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
    offset: FixedOffset,
}

impl SummaryService {
    pub fn new(
        recorder: Arc<ActivityRecorder>,
        llm: Arc<dyn LlmProvider>,
        timeout: Duration,
        offset: FixedOffset,
    ) -> Self {
        Self {
            recorder,
            llm,
            timeout,
            offset,
        }
    }

    /// Local calendar date at the configured offset.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// Summarize `date`, interpreted in the configured UTC offset.
    pub async fn daily(&self, date: NaiveDate) -> Result<DailySummary, DatabaseError> {
        let range = day_range(date, self.offset)?;
        let records = self.recorder.list(&range, &ActivityFilter::default()).await?;

        let mut counts: BTreeMap<RecordKind, u64> =
            RecordKind::ALL.iter().map(|k| (*k, 0)).collect();
        counts.extend(self.recorder.count_by_kind(&range).await?);
        let booked = booked_meetings(&records);
        let total: u64 = counts.values().sum();
        let meeting_requests = records.iter().filter(|r| is_meeting_record(r)).count() as u64;
        let mut priorities: BTreeMap<Priority, u64> =
            Priority::ALL.iter().map(|p| (*p, 0)).collect();
        for record in &records {
            *priorities.entry(record.priority()).or_default() += 1;
        }

        let narrative = if records.is_empty() {
            None
        } else {
            self.narrate(date, &records).await
        };
        let text = narrative
            .clone()
            .unwrap_or_else(|| {
                fallback_text(date, total, meeting_requests, &counts, &priorities, &booked)
            });

        info!(
            date = %date,
            total,
            meeting_requests,
            urgent = counts.get(&RecordKind::Urgent).copied().unwrap_or(0),
            booked = booked.len(),
            narrated = narrative.is_some(),
            "Daily summary built"
        );
        Ok(DailySummary {
            date,
            total,
            meeting_requests,
            counts,
            priorities,
            booked,
            narrative,
            text,
        })
    }

    async fn narrate(&self, date: NaiveDate, records: &[ActivityRecord]) -> Option<String> {
        let digest: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "kind": r.kind.as_str(),
                    "priority": r.priority().as_str(),
                    "from": r.message.sender_address(),
                    "subject": record_subject(r),
                    "action_items": r.classification.as_ref().map(|c| &c.action_items),
                    "slot": r.decision.as_ref().and_then(|d| d.chosen_slot).map(|s| s.to_string()),
                    "failure": r.failure,
                })
            })
            .collect();
        let prompt = format!(
            "Date: {date}\n\nActivities:\n{}",
            serde_json::to_string_pretty(&digest).unwrap_or_default()
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SUMMARY_INSTRUCTION),
            ChatMessage::user(prompt),
        ])
        .with_temperature(0.3)
        .with_max_tokens(400);

        match tokio::time::timeout(self.timeout, self.llm.complete(request)).await {
            Ok(Ok(response)) => {
                debug!(
                    model = self.llm.model_name(),
                    output_tokens = response.output_tokens,
                    "Summary narrative received"
                );
                let text = cap_words(response.content.trim(), MAX_NARRATIVE_WORDS);
                (!text.is_empty()).then_some(text)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Summary narrative failed, using fallback text");
                None
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Summary narrative timed out, using fallback text");
                None
            }
        }
    }
}

/// `[00:00, 24:00)` of `date` at `offset`, in UTC.
fn day_range(date: NaiveDate, offset: FixedOffset) -> Result<TimeRange, DatabaseError> {
    let start = date
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .ok_or_else(|| DatabaseError::Query(format!("no midnight for {date}")))?
        .with_timezone(&Utc);
    TimeRange::new(start, start + chrono::Duration::days(1))
        .map_err(|e| DatabaseError::Query(e.to_string()))
}

/// Records carrying a meeting decision, including ones whose reply failed.
fn is_meeting_record(record: &ActivityRecord) -> bool {
    record.kind.is_meeting() || record.decision.is_some()
}

fn record_subject(record: &ActivityRecord) -> &str {
    if is_meeting_record(record) {
        record.intent.title()
    } else {
        record.message.subject.trim()
    }
}

fn booked_meetings(records: &[ActivityRecord]) -> Vec<BookedMeeting> {
    records
        .iter()
        .filter(|r| r.kind == RecordKind::Book)
        .filter_map(|r| {
            let slot = r.decision.as_ref()?.chosen_slot?;
            Some(BookedMeeting {
                subject: r.intent.title().to_string(),
                participants: r.intent.participants.clone(),
                slot,
                booking_id: r.booking_id.clone(),
            })
        })
        .collect()
}

fn fallback_text(
    date: NaiveDate,
    total: u64,
    meeting_requests: u64,
    counts: &BTreeMap<RecordKind, u64>,
    priorities: &BTreeMap<Priority, u64>,
    booked: &[BookedMeeting],
) -> String {
    if total == 0 {
        return format!("No emails were processed on {date}.");
    }
    let count = |kind: RecordKind| counts.get(&kind).copied().unwrap_or(0);
    let priority = |p: Priority| priorities.get(&p).copied().unwrap_or(0);
    let mut text = format!(
        "{total} email(s) processed on {date}. {meeting_requests} meeting request(s): \
         {} booked, {} proposed, {} awaiting clarification, {} declined. \
         {} urgent, {} auto-replied, {} ignored, {} noted, {} failed. \
         Priority: {} high, {} medium, {} low.",
        count(RecordKind::Book),
        count(RecordKind::Propose),
        count(RecordKind::Clarify),
        count(RecordKind::Decline),
        count(RecordKind::Urgent),
        count(RecordKind::AutoReply),
        count(RecordKind::Ignored),
        count(RecordKind::Noted),
        count(RecordKind::Failed),
        priority(Priority::High),
        priority(Priority::Medium),
        priority(Priority::Low),
    );
    if !booked.is_empty() {
        let subjects: Vec<&str> = booked.iter().map(|m| m.subject.as_str()).collect();
        text.push_str(&format!(" Booked: {}.", subjects.join("; ")));
    }
    text
}

fn cap_words(text: &str, max: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max {
        return text.to_string();
    }
    format!("{}…", words[..max].join(" "))
}

/// Next fire time of a cron expression after `after`.
pub fn next_fire(schedule: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
    let schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(schedule.after(&after).next())
}

/// Spawn the background task that mails the daily summary to `recipient`
/// every time `schedule` fires. Fails fast on an invalid expression.
pub fn spawn_summary_ticker(
    schedule: &str,
    service: Arc<SummaryService>,
    mailer: Arc<dyn Mailer>,
    recipient: String,
) -> Result<tokio::task::JoinHandle<()>, String> {
    let expr = schedule.to_string();
    let mut next = next_fire(&expr, Utc::now())?;
    info!(next = ?next, recipient = %recipient, "Summary ticker scheduled");

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(due) = next else {
                warn!("Summary schedule has no further fire times, stopping ticker");
                return;
            };
            let now = Utc::now();
            if now < due {
                continue;
            }
            next = next_fire(&expr, now).ok().flatten();

            let date = service.local_date(due);
            match service.daily(date).await {
                Ok(summary) => match mailer.send(&summary.to_email(&recipient)).await {
                    Ok(id) => info!(date = %date, delivery_id = %id, "Daily summary sent"),
                    Err(e) => error!(date = %date, error = %e, "Failed to send daily summary"),
                },
                Err(e) => error!(date = %date, error = %e, "Failed to build daily summary"),
            }
        }
    }))
}
