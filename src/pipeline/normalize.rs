//! Text normalizer: turns a raw email into the canonical blob fed to the
//! intent extractor.
//!
//! Quoted history and signatures are removed so the extractor sees only what
//! the sender wrote in this message.

use crate::pipeline::types::RawMessage;

/// Default upper bound on normalized text length, in characters.
pub const DEFAULT_MAX_CHARS: usize = 4000;

/// Produce `Subject: …\n\n<body>` with quotes, reply history and signature
/// stripped, whitespace collapsed, truncated to `max_chars` characters.
pub fn normalize(message: &RawMessage, max_chars: usize) -> String {
    let body = clean_body(&message.body);
    let subject = collapse_spaces(message.subject.trim());

    let text = match (subject.is_empty(), body.is_empty()) {
        (true, _) => body,
        (false, true) => format!("Subject: {subject}"),
        (false, false) => format!("Subject: {subject}\n\n{body}"),
    };
    truncate_chars(text.trim(), max_chars)
}

fn clean_body(body: &str) -> String {
    let body = body.replace("\r\n", "\n").replace('\r', "\n");

    let mut kept: Vec<String> = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if is_reply_boundary(trimmed) || is_signature_start(line, trimmed) {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(collapse_spaces(trimmed));
    }

    // Collapse runs of blank lines into one.
    let mut out: Vec<String> = Vec::with_capacity(kept.len());
    for line in kept {
        if line.is_empty() && out.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

fn is_reply_boundary(trimmed: &str) -> bool {
    trimmed.ends_with("wrote:")
        || trimmed.eq_ignore_ascii_case("-----original message-----")
        || trimmed.starts_with("-----Original Message")
}

fn is_signature_start(line: &str, trimmed: &str) -> bool {
    line == "--" || line == "-- " || trimmed.starts_with("Sent from my ")
}

fn collapse_spaces(line: &str) -> String {
    line.split([' ', '\t'])
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}
