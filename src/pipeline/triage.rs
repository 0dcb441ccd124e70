//! Email triage: sorts inbound mail before any scheduling work happens.
//!
//! Runs ahead of intent extraction:
//! - Bulk and automated senders (noreply, newsletters, mailer-daemon) are
//!   caught by regex rules and never reach the LLM
//! - Everything else is classified by the LLM into a category, a priority
//!   and whether a short acknowledgement would do
//!
//! `route` turns the verdict into the one path the processor follows.
//! A classification failure routes to the meeting pipeline, whose own
//! extraction decides whether there is a meeting to schedule.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{LlmError, PipelineError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider, ResponseFormat};
use crate::pipeline::extract::extract_json_object;
use crate::pipeline::types::{Classification, EmailCategory, Priority, RawMessage};

/// Which message field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
}

#[derive(Debug, Clone)]
struct TriageRule {
    regex: Regex,
    field: RuleField,
    category: EmailCategory,
    name: String,
}

static BUILTIN_RULES: LazyLock<Vec<TriageRule>> = LazyLock::new(|| {
    [
        (r"(?i)^no[\-_.]?reply@", RuleField::Sender, EmailCategory::Update, "noreply sender"),
        (
            r"(?i)@(marketing|newsletter|promo|campaign)\b",
            RuleField::Sender,
            EmailCategory::Newsletter,
            "marketing sender",
        ),
        (
            r"(?i)^(mailer[\-_]?daemon|postmaster)@",
            RuleField::Sender,
            EmailCategory::Update,
            "mail system",
        ),
        (
            r"(?i)^notifications@github\.com$",
            RuleField::Sender,
            EmailCategory::Update,
            "github notification",
        ),
        (r"(?i)\bunsubscribe\b", RuleField::Subject, EmailCategory::Newsletter, "unsubscribe subject"),
        (
            r"(?i)(click here to unsubscribe|manage your subscription|email preferences|opt[- ]?out)",
            RuleField::Body,
            EmailCategory::Newsletter,
            "unsubscribe footer",
        ),
    ]
    .into_iter()
    .map(|(pattern, field, category, name)| TriageRule {
        regex: Regex::new(pattern).expect("valid built-in triage pattern"),
        field,
        category,
        name: name.to_string(),
    })
    .collect()
});

/// Deterministic pre-LLM rules for bulk and automated mail.
#[derive(Debug, Clone)]
pub struct TriageRules {
    rules: Vec<TriageRule>,
}

impl Default for TriageRules {
    fn default() -> Self {
        Self {
            rules: BUILTIN_RULES.clone(),
        }
    }
}

impl TriageRules {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule; mail matching `pattern` in `field` is filed as `category`
    /// without asking the LLM.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        category: EmailCategory,
        name: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(TriageRule {
            regex: Regex::new(pattern)?,
            field,
            category,
            name: name.to_string(),
        });
        Ok(())
    }

    /// First matching rule's verdict, if any.
    pub fn evaluate(&self, message: &RawMessage) -> Option<Classification> {
        let sender = message.sender_address();
        self.rules.iter().find_map(|rule| {
            let haystack = match rule.field {
                RuleField::Sender => sender.as_str(),
                RuleField::Subject => message.subject.as_str(),
                RuleField::Body => message.body.as_str(),
            };
            rule.regex.is_match(haystack).then(|| {
                debug!(rule = %rule.name, sender = %sender, "Triage rule matched");
                Classification::by_rule(rule.category, rule.name.clone())
            })
        })
    }
}

/// Where a classified email goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Meeting,
    Urgent,
    AutoReply,
    Ignore,
    Note,
}

/// Route a verdict. Rule matches are always dropped; meeting requests win
/// over priority, priority over auto-replies. Bulk mail is never answered.
pub fn route(classification: &Classification) -> Route {
    if classification.rule.is_some() {
        return Route::Ignore;
    }
    match classification.category {
        EmailCategory::MeetingRequest | EmailCategory::Unknown => Route::Meeting,
        EmailCategory::Spam | EmailCategory::Newsletter => Route::Ignore,
        EmailCategory::UrgentRequest => Route::Urgent,
        _ if classification.priority == Priority::High => Route::Urgent,
        _ if classification.can_auto_respond => Route::AutoReply,
        _ => Route::Note,
    }
}

/// Triage verdict plus the classifier failure it absorbed, if any.
#[derive(Debug, Clone)]
pub struct Triage {
    pub classification: Classification,
    pub failure: Option<PipelineError>,
}

/// Rules first, then the LLM.
pub struct EmailClassifier {
    rules: TriageRules,
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

const CLASSIFY_INSTRUCTION: &str = r#"You sort an executive's inbox. Classify the email and respond with a single JSON object:
- "category": "meeting_request" | "question" | "update" | "urgent_request" | "newsletter" | "spam"
- "priority": "high" | "medium" | "low"
- "can_auto_respond": true if a short acknowledgement from the assistant fully handles it
- "key_topics": array of short strings
- "action_items": array of short strings

Anything asking to meet, call or schedule time is a meeting_request."#;

impl EmailClassifier {
    pub fn new(rules: TriageRules, llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self {
            rules,
            llm,
            timeout,
        }
    }

    /// Classify one message. `text` is the normalized subject and body.
    /// Never fails; an unreadable answer yields `Unknown` plus the failure.
    pub async fn classify(&self, message: &RawMessage, text: &str) -> Triage {
        if let Some(classification) = self.rules.evaluate(message) {
            return Triage {
                classification,
                failure: None,
            };
        }

        match self.ask(&message.sender_address(), text).await {
            Ok(classification) => {
                info!(
                    id = %message.id,
                    category = ?classification.category,
                    priority = classification.priority.as_str(),
                    "Email classified"
                );
                Triage {
                    classification,
                    failure: None,
                }
            }
            Err(reason) => {
                warn!(id = %message.id, error = %reason, "Classification failed, treating as possible meeting request");
                Triage {
                    classification: Classification::unknown(),
                    failure: Some(PipelineError::ClassificationFailure(reason)),
                }
            }
        }
    }

    async fn ask(&self, sender: &str, text: &str) -> Result<Classification, String> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(CLASSIFY_INSTRUCTION),
            ChatMessage::user(format!("Sender: {sender}\n\nEmail:\n{text}")),
        ])
        .with_temperature(0.0)
        .with_max_tokens(300)
        .with_response_format(ResponseFormat::Json { schema: None });

        let response = match tokio::time::timeout(self.timeout, self.llm.complete(request)).await {
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
        parse_classification(&response.content)
    }
}

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    category: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    can_auto_respond: Option<bool>,
    #[serde(default)]
    key_topics: Vec<String>,
    #[serde(default)]
    action_items: Vec<String>,
}

fn parse_classification(raw: &str) -> Result<Classification, String> {
    let response: ClassificationResponse = serde_json::from_str(&extract_json_object(raw))
        .map_err(|e| format!("JSON parse error: {e}"))?;

    let category = response.category.parse::<EmailCategory>().unwrap_or_else(|e: String| {
        debug!(error = %e, "Unrecognized category");
        EmailCategory::Unknown
    });
    let priority = match response.priority.as_deref().map(str::to_ascii_lowercase) {
        Some(p) if p == "high" => Priority::High,
        Some(p) if p == "low" => Priority::Low,
        _ => Priority::Medium,
    };
    let clean = |items: Vec<String>| -> Vec<String> {
        items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };

    Ok(Classification {
        category,
        priority,
        can_auto_respond: response.can_auto_respond.unwrap_or(false),
        key_topics: clean(response.key_topics),
        action_items: clean(response.action_items),
        rule: None,
    })
}

// ── Auto-response ───────────────────────────────────────────────────

/// Upper bound on the generated acknowledgement.
const MAX_REPLY_WORDS: usize = 100;

const REPLY_INSTRUCTION: &str = "You reply on behalf of an executive's assistant. \
Write a short, courteous acknowledgement of the email below: thank the sender, \
answer briefly if it is a simple question, otherwise say when they can expect a \
full response. Plain text, no subject line, under 100 words.";

/// Drafts acknowledgement bodies for mail that needs no executive attention.
pub struct AutoResponder {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl AutoResponder {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Generated body, or a fixed acknowledgement when the LLM fails.
    pub async fn draft(&self, text: &str, classification: &Classification) -> String {
        let topics = if classification.key_topics.is_empty() {
            String::new()
        } else {
            format!("\nTopics: {}", classification.key_topics.join(", "))
        };
        let request = CompletionRequest::new(vec![
            ChatMessage::system(REPLY_INSTRUCTION),
            ChatMessage::user(format!("Email:\n{text}{topics}")),
        ])
        .with_temperature(0.3)
        .with_max_tokens(250);

        match tokio::time::timeout(self.timeout, self.llm.complete(request)).await {
            Ok(Ok(response)) => {
                let words: Vec<&str> = response.content.split_whitespace().collect();
                if words.is_empty() {
                    return fallback_reply();
                }
                words[..words.len().min(MAX_REPLY_WORDS)].join(" ")
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Auto-reply draft failed, using standard acknowledgement");
                fallback_reply()
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Auto-reply draft timed out, using standard acknowledgement");
                fallback_reply()
            }
        }
    }
}

fn fallback_reply() -> String {
    "Thank you for your email. It has been received and you will hear back shortly.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::llm::provider::{CompletionResponse, FinishReason};

    struct CannedLlm {
        reply: Result<String, String>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedLlm {
        fn new(reply: Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(String::from).map_err(String::from),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(last) = request.messages.last() {
                self.prompts.lock().unwrap().push(last.content.clone());
            }
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 0,
                    output_tokens: 0,
                    finish_reason: FinishReason::Stop,
                }),
                Err(e) => Err(LlmError::RequestFailed {
                    provider: "canned".into(),
                    reason: e.clone(),
                }),
            }
        }
    }

    fn msg(sender: &str, subject: &str, body: &str) -> RawMessage {
        RawMessage::new(sender, subject, body, Utc::now())
    }

    fn classifier(llm: Arc<CannedLlm>) -> EmailClassifier {
        EmailClassifier::new(TriageRules::default(), llm, Duration::from_secs(1))
    }

    #[test]
    fn rules_catch_bulk_senders() {
        let rules = TriageRules::default();
        for sender in [
            "No-Reply@shop.example.com",
            "noreply@example.com",
            "deals@newsletter.example.com",
            "MAILER-DAEMON@mx.example.com",
            "notifications@github.com",
        ] {
            let hit = rules.evaluate(&msg(sender, "Hello", "body"));
            assert!(hit.is_some(), "{sender} should match");
        }
        assert!(rules.evaluate(&msg("alice@example.com", "Sync", "Tuesday?")).is_none());
    }

    #[test]
    fn rules_catch_unsubscribe_subject_and_footer() {
        let rules = TriageRules::default();
        let subject = rules.evaluate(&msg("a@example.com", "Unsubscribe confirmation", "x")).unwrap();
        assert_eq!(subject.category, EmailCategory::Newsletter);
        let footer = rules
            .evaluate(&msg("a@example.com", "Deals", "Big sale!\nClick here to unsubscribe."))
            .unwrap();
        assert_eq!(footer.rule.as_deref(), Some("unsubscribe footer"));
    }

    #[test]
    fn custom_rule_is_applied() {
        let mut rules = TriageRules::empty();
        rules
            .add_rule(r"(?i)^billing@", RuleField::Sender, EmailCategory::Update, "billing")
            .unwrap();
        assert!(rules.evaluate(&msg("Billing@vendor.example.com", "Invoice", "x")).is_some());
        assert!(rules.add_rule("(", RuleField::Body, EmailCategory::Spam, "bad").is_err());
    }

    #[tokio::test]
    async fn rule_match_skips_llm() {
        let llm = CannedLlm::new(Ok(r#"{"category": "meeting_request"}"#));
        let triage = classifier(llm.clone())
            .classify(&msg("noreply@example.com", "Receipt", "x"), "Receipt\n\nx")
            .await;
        assert_eq!(route(&triage.classification), Route::Ignore);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn llm_classification_is_parsed() {
        let llm = CannedLlm::new(Ok(
            "```json\n{\"category\": \"question\", \"priority\": \"low\", \"can_auto_respond\": true, \"key_topics\": [\" pricing \", \"\"]}\n```",
        ));
        let triage = classifier(llm.clone())
            .classify(&msg("carol@example.com", "Pricing", "What's the price?"), "Pricing")
            .await;
        let c = triage.classification;
        assert_eq!(c.category, EmailCategory::Question);
        assert_eq!(c.priority, Priority::Low);
        assert!(c.can_auto_respond);
        assert_eq!(c.key_topics, vec!["pricing"]);
        assert!(triage.failure.is_none());
        assert!(llm.prompts.lock().unwrap()[0].contains("carol@example.com"));
    }

    #[tokio::test]
    async fn unreadable_answer_is_unknown_and_routes_to_meeting() {
        let llm = CannedLlm::new(Ok("no idea"));
        let triage = classifier(llm)
            .classify(&msg("dan@example.com", "Hi", "Can we talk?"), "Hi")
            .await;
        assert_eq!(triage.classification.category, EmailCategory::Unknown);
        assert!(matches!(triage.failure, Some(PipelineError::ClassificationFailure(_))));
        assert_eq!(route(&triage.classification), Route::Meeting);
    }

    #[tokio::test]
    async fn llm_error_is_unknown() {
        let triage = classifier(CannedLlm::new(Err("overloaded")))
            .classify(&msg("dan@example.com", "Hi", "x"), "Hi")
            .await;
        assert_eq!(triage.classification, Classification::unknown());
        assert!(triage.failure.unwrap().to_string().contains("overloaded"));
    }

    #[test]
    fn routing_order() {
        let with = |category, priority, auto| Classification {
            category,
            priority,
            can_auto_respond: auto,
            ..Classification::unknown()
        };
        assert_eq!(route(&with(EmailCategory::MeetingRequest, Priority::High, true)), Route::Meeting);
        assert_eq!(route(&with(EmailCategory::Question, Priority::High, true)), Route::Urgent);
        assert_eq!(route(&with(EmailCategory::UrgentRequest, Priority::Low, false)), Route::Urgent);
        assert_eq!(route(&with(EmailCategory::Question, Priority::Medium, true)), Route::AutoReply);
        assert_eq!(route(&with(EmailCategory::Spam, Priority::High, true)), Route::Ignore);
        assert_eq!(route(&with(EmailCategory::Update, Priority::Low, false)), Route::Note);
    }

    #[tokio::test]
    async fn auto_reply_is_capped_and_falls_back() {
        let long = vec!["thanks"; 180].join(" ");
        let responder = AutoResponder::new(CannedLlm::new(Ok(long.as_str())), Duration::from_secs(1));
        let body = responder.draft("Question?", &Classification::unknown()).await;
        assert_eq!(body.split_whitespace().count(), MAX_REPLY_WORDS);

        let failing = AutoResponder::new(CannedLlm::new(Err("down")), Duration::from_secs(1));
        assert_eq!(failing.draft("Question?", &Classification::unknown()).await, fallback_reply());
    }
}
