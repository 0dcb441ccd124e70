//! Shared types for the meeting-request pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Inbound message ─────────────────────────────────────────────────

/// An email as received from the mail provider. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Provider message id, or a generated UUID.
    pub id: String,
    /// `From` header value; may be `Name <addr>` or a bare address.
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            received_at,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Bare lowercase address of the sender.
    pub fn sender_address(&self) -> String {
        extract_address(&self.sender)
    }
}

static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+)>").expect("valid angle-address regex"));

/// Pull the address out of `Name <addr@host>`, or return the trimmed input.
pub fn extract_address(value: &str) -> String {
    let addr = ANGLE_ADDRESS
        .captures(value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(value);
    addr.trim().to_lowercase()
}

/// Loose structural check: one `@` with something on both sides and a dot in
/// the domain.
pub fn is_valid_address(addr: &str) -> bool {
    let mut parts = addr.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !addr.chars().any(char::is_whitespace)
        }
        _ => false,
    }
}

// ── Time ranges ─────────────────────────────────────────────────────

/// Half-open interval `[start, end)` with `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Error returned when constructing an empty or inverted range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("time range start {start} is not before end {end}")]
pub struct InvalidRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidRange> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(InvalidRange { start, end })
        }
    }

    /// Range of `minutes` starting at `start`. `minutes` must be positive.
    pub fn starting_at(start: DateTime<Utc>, minutes: u32) -> Result<Self, InvalidRange> {
        Self::new(start, start + Duration::minutes(i64::from(minutes)))
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Drop the part of this range before `from`; `None` if nothing remains.
    pub fn clip_start(&self, from: DateTime<Utc>) -> Option<TimeRange> {
        TimeRange::new(self.start.max(from), self.end).ok()
    }

    /// Drop the part of this range after `until`; `None` if nothing remains.
    pub fn clip_end(&self, until: DateTime<Utc>) -> Option<TimeRange> {
        TimeRange::new(self.start, self.end.min(until)).ok()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} – {}",
            self.start.format("%a %b %-d, %H:%M UTC"),
            self.end.format("%H:%M UTC")
        )
    }
}

impl<'de> Deserialize<'de> for TimeRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        }
        let raw = Raw::deserialize(deserializer)?;
        TimeRange::new(raw.start, raw.end).map_err(serde::de::Error::custom)
    }
}

/// Sort and merge overlapping or touching ranges.
pub fn merge_ranges(ranges: &[TimeRange]) -> Vec<TimeRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort();
    let mut merged: Vec<TimeRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

// ── Triage ──────────────────────────────────────────────────────────

/// What kind of email this is, as far as the assistant cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailCategory {
    MeetingRequest,
    Question,
    Update,
    UrgentRequest,
    Newsletter,
    Spam,
    /// Classification failed or returned something unrecognized.
    Unknown,
}

impl std::str::FromStr for EmailCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "meeting_request" | "meeting" => Ok(Self::MeetingRequest),
            "question" => Ok(Self::Question),
            "update" => Ok(Self::Update),
            "urgent_request" | "urgent" => Ok(Self::UrgentRequest),
            "newsletter" => Ok(Self::Newsletter),
            "spam" => Ok(Self::Spam),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown email category '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Self::High, Self::Medium, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Triage verdict for one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: EmailCategory,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub can_auto_respond: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_items: Vec<String>,
    /// Name of the deterministic rule that decided, when no LLM was asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl Classification {
    /// Verdict used when the classifier could not decide.
    pub fn unknown() -> Self {
        Self {
            category: EmailCategory::Unknown,
            priority: Priority::Medium,
            can_auto_respond: false,
            key_topics: Vec::new(),
            action_items: Vec::new(),
            rule: None,
        }
    }

    /// Verdict from a bulk-mail rule.
    pub fn by_rule(category: EmailCategory, rule: impl Into<String>) -> Self {
        Self {
            category,
            priority: Priority::Low,
            rule: Some(rule.into()),
            ..Self::unknown()
        }
    }
}

// ── Intent ──────────────────────────────────────────────────────────

/// How soon the sender wants to meet. Drives the default search horizon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    High,
    #[default]
    Medium,
    Low,
}

impl Urgency {
    /// Business days to search given the configured medium horizon.
    pub fn horizon_days(&self, medium: u32) -> u32 {
        match self {
            Self::High => 3.min(medium.max(1)),
            Self::Medium => medium.max(1),
            Self::Low => medium.max(1) * 2,
        }
    }
}

/// Structured reading of a meeting request. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingIntent {
    pub participants: BTreeSet<String>,
    pub duration_minutes: u32,
    pub preferred_windows: Vec<TimeRange>,
    pub constraints: BTreeMap<String, String>,
    pub confidence: f64,
    /// Meeting topic, used as the calendar event title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub urgency: Urgency,
    /// The sender accepts any time that satisfies the constraints.
    #[serde(default)]
    pub auto_book: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agenda_items: Vec<String>,
}

/// Duration assumed when the request does not state one.
pub const DEFAULT_DURATION_MINUTES: u32 = 30;

impl MeetingIntent {
    /// Intent that signals "extraction failed": confidence 0, no windows.
    pub fn unresolved(sender: &str) -> Self {
        let mut participants = BTreeSet::new();
        if is_valid_address(sender) {
            participants.insert(sender.to_string());
        }
        Self {
            participants,
            duration_minutes: DEFAULT_DURATION_MINUTES,
            preferred_windows: Vec::new(),
            constraints: BTreeMap::new(),
            confidence: 0.0,
            subject: None,
            urgency: Urgency::Medium,
            auto_book: false,
            agenda_items: Vec::new(),
        }
    }

    /// Event title, falling back to a generic one.
    pub fn title(&self) -> &str {
        self.subject.as_deref().unwrap_or("Meeting")
    }
}

// ── Availability ────────────────────────────────────────────────────

/// Sort key for candidate slots; smaller is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRank {
    /// 0 inside a preferred window, 1 otherwise.
    pub outside_preferred: u8,
    /// Seconds from the earliest preferred start (or search start).
    pub distance_secs: i64,
    /// 0 inside business hours, 1 otherwise.
    pub off_hours: u8,
}

/// A candidate slot where every attendee is free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub range: TimeRange,
    pub attendees_free: BTreeSet<String>,
    pub rank: SlotRank,
}

// ── Decision ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Book,
    Propose,
    Clarify,
    Decline,
}

impl DecisionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Propose => "propose",
            Self::Clarify => "clarify",
            Self::Decline => "decline",
        }
    }
}

/// Outcome of the decision engine for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub chosen_slot: Option<TimeRange>,
    pub alternative_slots: Vec<TimeRange>,
    pub rationale: String,
}

impl Decision {
    pub fn clarify(rationale: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Clarify,
            chosen_slot: None,
            alternative_slots: Vec::new(),
            rationale: rationale.into(),
        }
    }

    pub fn decline(rationale: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Decline,
            chosen_slot: None,
            alternative_slots: Vec::new(),
            rationale: rationale.into(),
        }
    }
}

// ── Activity record ─────────────────────────────────────────────────

/// Record classification. The first four mirror meeting decisions;
/// `Failed` marks units whose outbound step failed; the rest come from
/// triage of mail that never entered the meeting pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Book,
    Propose,
    Clarify,
    Decline,
    Failed,
    /// High-priority mail flagged for the executive.
    Urgent,
    /// Answered with a generated acknowledgement.
    AutoReply,
    /// Bulk or automated mail, dropped without a reply.
    Ignored,
    /// Read and filed; nothing to do.
    Noted,
}

impl RecordKind {
    pub const ALL: [RecordKind; 9] = [
        Self::Book,
        Self::Propose,
        Self::Clarify,
        Self::Decline,
        Self::Failed,
        Self::Urgent,
        Self::AutoReply,
        Self::Ignored,
        Self::Noted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Propose => "propose",
            Self::Clarify => "clarify",
            Self::Decline => "decline",
            Self::Failed => "failed",
            Self::Urgent => "urgent",
            Self::AutoReply => "auto_reply",
            Self::Ignored => "ignored",
            Self::Noted => "noted",
        }
    }

    /// Whether this kind is a meeting-pipeline outcome.
    pub fn is_meeting(&self) -> bool {
        matches!(self, Self::Book | Self::Propose | Self::Clarify | Self::Decline)
    }
}

impl From<DecisionKind> for RecordKind {
    fn from(kind: DecisionKind) -> Self {
        match kind {
            DecisionKind::Book => Self::Book,
            DecisionKind::Propose => Self::Propose,
            DecisionKind::Clarify => Self::Clarify,
            DecisionKind::Decline => Self::Decline,
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown record kind '{s}'"))
    }
}

/// Append-only audit entry for one processed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub message: RawMessage,
    pub intent: MeetingIntent,
    pub decision: Option<Decision>,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    pub created_at: DateTime<Utc>,
}

impl ActivityRecord {
    /// Record for a completed decision.
    pub fn completed(message: RawMessage, intent: MeetingIntent, decision: Decision) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            intent,
            kind: decision.kind.into(),
            decision: Some(decision),
            failure: None,
            booking_id: None,
            delivery_id: None,
            classification: None,
            created_at: Utc::now(),
        }
    }

    /// Record for mail handled by triage alone. The intent is the
    /// zero-confidence placeholder titled with the email subject.
    pub fn triaged(message: RawMessage, classification: Classification, kind: RecordKind) -> Self {
        let mut intent = MeetingIntent::unresolved(&message.sender_address());
        intent.subject = Some(message.subject.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            id: Uuid::new_v4(),
            message,
            intent,
            decision: None,
            kind,
            failure: None,
            booking_id: None,
            delivery_id: None,
            classification: Some(classification),
            created_at: Utc::now(),
        }
    }

    /// Record for a unit of work that failed after (or without) a decision.
    pub fn failed(
        message: RawMessage,
        intent: MeetingIntent,
        decision: Option<Decision>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            intent,
            decision,
            kind: RecordKind::Failed,
            failure: Some(reason.into()),
            booking_id: None,
            delivery_id: None,
            classification: None,
            created_at: Utc::now(),
        }
    }

    /// Triage priority, `Medium` when the record carries no classification.
    pub fn priority(&self) -> Priority {
        self.classification
            .as_ref()
            .map(|c| c.priority)
            .unwrap_or_default()
    }
}
