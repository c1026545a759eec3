use html2text::from_read;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use serde::Serialize;

use crate::errors::{WatchError, WatchResult};

/// Raw bytes as they came off the wire for one UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    pub size: Option<u32>,
    pub body: Vec<u8>,
}

/// What the new-message and history callbacks receive.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ParsedMessage {
    pub uid: u32,
    pub message_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub date: Option<i64>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub size: usize,
    pub has_attachments: bool,
}

impl ParsedMessage {
    /// A sender plus at least one of subject, text, or markup.
    pub fn is_deliverable(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.from) && (present(&self.subject) || present(&self.text) || present(&self.html))
    }
}

pub fn parse_message(raw: &RawMessage) -> WatchResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(&raw.body)
        .map_err(|e| WatchError::Protocol(format!("parsing MIME for UID {}: {e}", raw.uid)))?;

    let header = |name: &str| {
        parsed
            .headers
            .get_first_value(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let html = find_part(&parsed, "text/html");
    let text = find_part(&parsed, "text/plain").or_else(|| html.as_deref().map(html_to_text));
    let date = header("Date").and_then(|d| mailparse::dateparse(&d).ok());

    Ok(ParsedMessage {
        uid: raw.uid,
        message_id: header("Message-ID"),
        from: header("From"),
        to: header("To"),
        subject: header("Subject"),
        date,
        text,
        html,
        size: raw.body.len(),
        has_attachments: detect_attachments(&parsed),
    })
}

fn find_part(part: &ParsedMail, mimetype: &str) -> Option<String> {
    if part.subparts.is_empty() {
        let disposition = part.get_content_disposition().disposition;
        if part.ctype.mimetype.eq_ignore_ascii_case(mimetype)
            && disposition != DispositionType::Attachment
        {
            return part.get_body().ok().filter(|b| !b.trim().is_empty());
        }
        return None;
    }
    part.subparts.iter().find_map(|p| find_part(p, mimetype))
}

fn detect_attachments(parsed: &ParsedMail) -> bool {
    parsed.subparts.iter().any(|part| {
        part.get_content_disposition().disposition == DispositionType::Attachment
            || detect_attachments(part)
    })
}

fn html_to_text(html: &str) -> String {
    from_read(html.as_bytes(), 80).unwrap_or_default()
}
