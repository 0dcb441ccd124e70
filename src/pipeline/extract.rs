//! Intent extractor: asks the LLM for a structured reading of a meeting
//! request and validates what comes back.
//!
//! The extractor never fails outright. Malformed output is retried once with
//! a stricter instruction; a second failure yields a zero-confidence intent
//! so the decision engine asks the sender for clarification.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{LlmError, PipelineError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider, ResponseFormat};
use crate::pipeline::types::{
    DEFAULT_DURATION_MINUTES, MeetingIntent, TimeRange, Urgency, is_valid_address,
};

/// Max tokens for the extraction call.
const EXTRACT_MAX_TOKENS: u32 = 1024;

/// Low temperature: we want the same reading for the same email.
const EXTRACT_TEMPERATURE: f32 = 0.0;

/// Appended to the prompt on the retry after malformed output.
const STRICT_INSTRUCTION: &str = "IMPORTANT: your previous answer could not be parsed. \
Return valid JSON only, matching the schema exactly. No prose, no markdown.";

/// Result of one extraction. `failure` is set when the intent is the
/// zero-confidence fallback.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub intent: MeetingIntent,
    pub failure: Option<PipelineError>,
}

/// LLM-backed meeting-intent extractor.
pub struct IntentExtractor {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
    high_threshold: f64,
}

impl IntentExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration, high_threshold: f64) -> Self {
        Self {
            llm,
            timeout,
            high_threshold,
        }
    }

    /// Extract a meeting intent from normalized text.
    ///
    /// `sender` is the bare sender address; `now` anchors relative dates
    /// such as "next Tuesday".
    pub async fn extract(&self, text: &str, sender: &str, now: DateTime<Utc>) -> Extraction {
        let user_prompt = build_user_prompt(text, sender, now);

        let first = self.attempt(&user_prompt, sender).await;
        let first_err = match first {
            Ok(intent) => return self.success(intent, sender),
            Err(e) => e,
        };
        warn!(sender, error = %first_err, "Extraction attempt failed, retrying with strict prompt");

        let strict_prompt = format!("{user_prompt}\n\n{STRICT_INSTRUCTION}");
        match self.attempt(&strict_prompt, sender).await {
            Ok(intent) => self.success(intent, sender),
            Err(second_err) => {
                warn!(sender, error = %second_err, "Extraction failed after retry");
                Extraction {
                    intent: MeetingIntent::unresolved(sender),
                    failure: Some(PipelineError::ExtractionFailure(second_err)),
                }
            }
        }
    }

    fn success(&self, intent: MeetingIntent, sender: &str) -> Extraction {
        info!(
            sender,
            confidence = intent.confidence,
            participants = intent.participants.len(),
            windows = intent.preferred_windows.len(),
            duration = intent.duration_minutes,
            "Extracted meeting intent"
        );
        Extraction {
            intent,
            failure: None,
        }
    }

    async fn attempt(&self, user_prompt: &str, sender: &str) -> Result<MeetingIntent, String> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(user_prompt),
        ])
        .with_max_tokens(EXTRACT_MAX_TOKENS)
        .with_temperature(EXTRACT_TEMPERATURE)
        .with_response_format(ResponseFormat::Json {
            schema: Some(response_schema()),
        });

        let response = match tokio::time::timeout(self.timeout, self.llm.complete(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => {
                return Err(LlmError::Timeout {
                    provider: self.llm.model_name().to_string(),
                    timeout: self.timeout,
                }
                .to_string());
            }
        };
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Extraction response received"
        );

        parse_extraction_response(&response.content, sender, self.high_threshold)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    r#"You read business emails on behalf of an executive and extract meeting requests.

Respond with a single JSON object with these fields:
- "is_meeting_request": boolean
- "participants": array of email addresses who should attend (besides the executive)
- "duration_minutes": integer > 0, omit if the email does not say
- "preferred_windows": array of {"start": RFC 3339, "end": RFC 3339} time ranges the sender proposed; empty if none
- "constraints": object of string values, e.g. {"timezone": "America/New_York", "location": "video"}
- "subject": short meeting title
- "urgency": "high" | "medium" | "low"
- "auto_book": true only if the sender explicitly accepts any time that fits
- "agenda_items": array of short strings
- "confidence": number in [0, 1], how sure you are of this reading

Resolve relative dates ("tomorrow", "next Tuesday") against the reference time.
Never invent participants or times that are not in the email."#
        .to_string()
}

fn build_user_prompt(text: &str, sender: &str, now: DateTime<Utc>) -> String {
    format!(
        "Sender: {sender}\nReference time: {} ({})\n\nEmail:\n{text}",
        now.to_rfc3339(),
        now.format("%A")
    )
}

fn response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "is_meeting_request": {"type": "boolean"},
            "participants": {"type": "array", "items": {"type": "string"}},
            "duration_minutes": {"type": "integer", "minimum": 1},
            "preferred_windows": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "start": {"type": "string"},
                        "end": {"type": "string"}
                    },
                    "required": ["start", "end"]
                }
            },
            "constraints": {"type": "object", "additionalProperties": {"type": "string"}},
            "subject": {"type": "string"},
            "urgency": {"enum": ["high", "medium", "low"]},
            "auto_book": {"type": "boolean"},
            "agenda_items": {"type": "array", "items": {"type": "string"}},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1}
        },
        "required": ["is_meeting_request"]
    })
}

// ── Response parsing ────────────────────────────────────────────────

/// Raw LLM extraction payload, before validation.
#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    is_meeting_request: Option<bool>,
    #[serde(default)]
    participants: Vec<String>,
    #[serde(default)]
    duration_minutes: Option<i64>,
    #[serde(default)]
    preferred_windows: Vec<RawWindow>,
    #[serde(default)]
    constraints: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    urgency: Option<String>,
    #[serde(default)]
    auto_book: Option<bool>,
    #[serde(default)]
    agenda_items: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawWindow {
    start: String,
    end: String,
}

/// Parse and validate an extraction response.
fn parse_extraction_response(
    raw: &str,
    sender: &str,
    high_threshold: f64,
) -> Result<MeetingIntent, String> {
    let json_str = extract_json_object(raw);
    let response: ExtractionResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    if response.is_meeting_request == Some(false) {
        let mut intent = MeetingIntent::unresolved(sender);
        intent.subject = response.subject.filter(|s| !s.trim().is_empty());
        return Ok(intent);
    }

    let mut participants = BTreeSet::new();
    for raw in &response.participants {
        let addr = raw.trim().to_lowercase();
        if !is_valid_address(&addr) {
            return Err(format!("invalid participant address: '{raw}'"));
        }
        participants.insert(addr);
    }

    let duration_minutes = match response.duration_minutes {
        Some(d) if d <= 0 => return Err(format!("duration_minutes must be positive, got {d}")),
        Some(d) => {
            Some(u32::try_from(d).map_err(|_| format!("duration_minutes out of range: {d}"))?)
        }
        None => None,
    };

    let mut preferred_windows = Vec::with_capacity(response.preferred_windows.len());
    for window in &response.preferred_windows {
        let start = parse_timestamp(&window.start)?;
        let end = parse_timestamp(&window.end)?;
        let range = TimeRange::new(start, end).map_err(|e| e.to_string())?;
        preferred_windows.push(range);
    }

    if let Some(c) = response.confidence
        && !c.is_finite()
    {
        return Err("confidence is not a finite number".to_string());
    }

    let subject = response
        .subject
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let confidence = match response.confidence {
        Some(c) => c.clamp(0.0, 1.0),
        None => heuristic_confidence(
            !participants.is_empty(),
            duration_minutes.is_some(),
            !preferred_windows.is_empty(),
            subject.is_some(),
        ),
    };
    let confidence = if duration_minutes.is_none() {
        confidence.min((high_threshold - 0.01).max(0.0))
    } else {
        confidence
    };

    if is_valid_address(sender) {
        participants.insert(sender.to_string());
    }

    let constraints = response
        .constraints
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, value)
        })
        .collect();

    let urgency = match response.urgency.as_deref().map(str::to_ascii_lowercase) {
        Some(u) if u == "high" => Urgency::High,
        Some(u) if u == "low" => Urgency::Low,
        _ => Urgency::Medium,
    };

    Ok(MeetingIntent {
        participants,
        duration_minutes: duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES),
        preferred_windows,
        constraints,
        confidence,
        subject,
        urgency,
        auto_book: response.auto_book.unwrap_or(false),
        agenda_items: response
            .agenda_items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{value}': {e}"))
}

/// 0.25 per present field, capped at 1.0.
fn heuristic_confidence(
    has_participants: bool,
    has_duration: bool,
    has_windows: bool,
    has_subject: bool,
) -> f64 {
    let present = [has_participants, has_duration, has_windows, has_subject]
        .into_iter()
        .filter(|&p| p)
        .count();
    (present as f64 * 0.25).min(1.0)
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub(crate) fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
