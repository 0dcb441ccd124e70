//! RFC 822 / MIME parsing into `RawMessage`.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use uuid::Uuid;

use crate::pipeline::types::RawMessage;

/// Parse a raw email document. Returns `None` when the input is not a
/// parseable message.
pub fn parse_rfc822(raw: &[u8]) -> Option<RawMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = extract_sender(&parsed)?;
    let subject = parsed.subject().unwrap_or_default().to_string();
    let body = extract_text(&parsed);
    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(RawMessage {
        id,
        sender,
        subject,
        body,
        received_at,
    })
}

/// `Name <addr>` when a display name is present, otherwise the bare address.
fn extract_sender(parsed: &mail_parser::Message) -> Option<String> {
    let addr = parsed.from().and_then(|a| a.first())?;
    let address = addr.address()?;
    Some(match addr.name() {
        Some(name) if !name.trim().is_empty() => format!("{} <{address}>", name.trim()),
        _ => address.to_string(),
    })
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Drop tags and collapse whitespace. Good enough for HTML-only emails.
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
