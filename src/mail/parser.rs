use mail_parser::{MessageParser, MimeHeaders, PartType};
use sha2::{Digest, Sha256};

use super::types::EmailFlags;

/// Fields of a raw message the reconciler and the pipeline need.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    /// `Message-ID` header, or a content hash when the header is missing.
    pub mime_message_id: String,
    pub subject: String,
    pub from_addr: String,
    pub date: Option<i64>,
    pub preview: Option<String>,
    pub calendar: Option<CalendarInvite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarInvite {
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub ics: String,
}

/// SHA-256 hex digest of a raw message.
pub fn content_hash(raw: &[u8]) -> String {
    format!("{:x}", Sha256::digest(raw))
}

pub fn parse_message(raw: &[u8]) -> ParsedMessage {
    let Some(message) = MessageParser::default().parse(raw) else {
        return ParsedMessage {
            mime_message_id: content_hash(raw),
            ..ParsedMessage::default()
        };
    };

    let mime_message_id = message
        .message_id()
        .map(|s| s.trim_matches(|c| c == '<' || c == '>').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| content_hash(raw));

    let from_addr = message
        .from()
        .and_then(|from| from.first())
        .and_then(|addr| addr.address())
        .map(|s| s.to_string())
        .unwrap_or_default();

    let subject = message.subject().map(|s| s.to_string()).unwrap_or_default();
    let date = message.date().map(|d| d.to_timestamp());
    let preview = extract_preview(&message, 100);
    let calendar = extract_calendar(&message);

    ParsedMessage {
        mime_message_id,
        subject,
        from_addr,
        date,
        preview,
        calendar,
    }
}

fn extract_preview(message: &mail_parser::Message, max_len: usize) -> Option<String> {
    let text = message.text_bodies().find_map(|part| match &part.body {
        PartType::Text(text) => Some(text.to_string()),
        _ => None,
    })?;

    let preview: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == ' ')
        .take(max_len)
        .collect();

    let preview = preview.trim().to_string();

    if preview.is_empty() {
        None
    } else {
        Some(preview)
    }
}

fn extract_calendar(message: &mail_parser::Message) -> Option<CalendarInvite> {
    let part = message.parts.iter().find(|part| {
        part.content_type()
            .map(|ct| {
                ct.ctype().eq_ignore_ascii_case("text")
                    && ct
                        .subtype()
                        .is_some_and(|sub| sub.eq_ignore_ascii_case("calendar"))
            })
            .unwrap_or(false)
    })?;

    let ics = match &part.body {
        PartType::Text(text) => text.to_string(),
        PartType::Binary(data) | PartType::InlineBinary(data) => {
            String::from_utf8_lossy(data).into_owned()
        }
        _ => return None,
    };

    let property = |name: &str| {
        ics.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.split_once(':'))
            .map(|(_, value)| value.trim().to_string())
    };

    Some(CalendarInvite {
        uid: property("UID"),
        summary: property("SUMMARY"),
        ics: ics.clone(),
    })
}

pub fn parse_flags_from_imap(flags: &[async_imap::types::Flag<'_>]) -> EmailFlags {
    let mut result = EmailFlags::empty();

    for flag in flags {
        match flag {
            async_imap::types::Flag::Seen => result |= EmailFlags::SEEN,
            async_imap::types::Flag::Answered => result |= EmailFlags::ANSWERED,
            async_imap::types::Flag::Flagged => result |= EmailFlags::FLAGGED,
            async_imap::types::Flag::Deleted => result |= EmailFlags::DELETED,
            async_imap::types::Flag::Draft => result |= EmailFlags::DRAFT,
            _ => {}
        }
    }

    result
}

/// Flags from raw names as they appear in an unsolicited FETCH response.
pub fn parse_flag_names<S: AsRef<str>>(names: &[S]) -> EmailFlags {
    let mut result = EmailFlags::empty();

    for name in names {
        match name.as_ref().to_ascii_lowercase().as_str() {
            "\\seen" => result |= EmailFlags::SEEN,
            "\\answered" => result |= EmailFlags::ANSWERED,
            "\\flagged" => result |= EmailFlags::FLAGGED,
            "\\deleted" => result |= EmailFlags::DELETED,
            "\\draft" => result |= EmailFlags::DRAFT,
            _ => {}
        }
    }

    result
}
