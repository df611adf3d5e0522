//! Bounce mail field extraction
//!
//! Pulls the bounced recipient and the campaign/subscriber uuids out of a
//! raw bounce message. Proper headers are preferred; the message text is
//! consulted only when headers yield nothing valid, since body matches are
//! lower confidence (a quoted reply can carry unrelated uuids). Values
//! that are not well-formed v4 uuids are discarded so recording can fall
//! back to the email address.

use crate::messenger::{CAMPAIGN_UUID_HEADER, SUBSCRIBER_UUID_HEADER};
use listmill_common::types::valid_v4_uuid;
use mail_parser::MessageParser;
use regex::Regex;
use uuid::Uuid;

/// Keywords whose vicinity is searched for a campaign uuid as a last
/// resort, in confidence order.
const CAMPAIGN_KEYWORDS: &[&str] = &["x-listmonk-campaign", "campaign", "listmonk"];

/// How far past a keyword the uuid may appear
const KEYWORD_WINDOW: usize = 200;

/// Fields extracted from one bounce message
#[derive(Debug, Clone, Default)]
pub struct ParsedBounce {
    /// Bounced recipient; empty when nothing could be extracted
    pub email: String,
    pub campaign_uuid: Option<Uuid>,
    pub subscriber_uuid: Option<Uuid>,
    /// Ancillary headers for the bounce record
    pub meta: serde_json::Value,
}

/// Bounce field extractor for one scanned mailbox
pub struct BounceParser {
    /// The mailbox's own address, excluded from recipient extraction
    mailbox_addr: String,
    final_recipient_re: Regex,
    original_recipient_re: Regex,
    loose_recipient_re: Regex,
    campaign_header_re: Regex,
    subscriber_header_re: Regex,
    uuid_re: Regex,
}

impl BounceParser {
    pub fn new(mailbox_addr: &str) -> Self {
        let addr = r#"<?([A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+)>?"#;
        let uuid = r#"([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})"#;

        Self {
            mailbox_addr: mailbox_addr.to_lowercase(),
            final_recipient_re: Regex::new(&format!(
                r"(?i)final-recipient:\s*(?:rfc822;?\s*)?{}",
                addr
            ))
            .unwrap(),
            original_recipient_re: Regex::new(&format!(
                r"(?i)original-recipient:\s*(?:rfc822;?\s*)?{}",
                addr
            ))
            .unwrap(),
            loose_recipient_re: Regex::new(&format!(r"(?i)\b(?:to|recipient):\s*{}", addr))
                .unwrap(),
            campaign_header_re: Regex::new(&format!(r"(?i)x-listmonk-campaign:\s*<?{}", uuid))
                .unwrap(),
            subscriber_header_re: Regex::new(&format!(r"(?i)x-listmonk-subscriber:\s*<?{}", uuid))
                .unwrap(),
            uuid_re: Regex::new(uuid).unwrap(),
        }
    }

    /// Extract the bounce fields from a raw message.
    pub fn parse(&self, raw: &[u8]) -> ParsedBounce {
        let text = String::from_utf8_lossy(raw);
        let message = MessageParser::default().parse(raw);

        let mut meta = serde_json::Map::new();
        if let Some(msg) = &message {
            if let Some(from) = msg
                .from()
                .and_then(|a| a.first())
                .and_then(|a| a.address.as_deref())
            {
                meta.insert("from".to_string(), from.into());
            }
            if let Some(subject) = msg.subject() {
                meta.insert("subject".to_string(), subject.into());
            }
            if let Some(message_id) = msg.message_id() {
                meta.insert("message_id".to_string(), message_id.into());
            }
            if let Some(delivered_to) = header_text(msg, "Delivered-To") {
                meta.insert("delivered_to".to_string(), delivered_to.into());
            }
        }

        ParsedBounce {
            email: self.extract_recipient(message.as_ref(), &text),
            campaign_uuid: self.extract_campaign_uuid(message.as_ref(), &text),
            subscriber_uuid: self.extract_subscriber_uuid(message.as_ref(), &text),
            meta: serde_json::Value::Object(meta),
        }
    }

    /// Recipient preference: Final-Recipient, Original-Recipient,
    /// Delivered-To (unless it is the bounce mailbox itself), then loose
    /// body patterns. The mailbox's own address never counts.
    fn extract_recipient(&self, message: Option<&mail_parser::Message>, text: &str) -> String {
        let header_sources = [
            ("Final-Recipient", true),
            ("Original-Recipient", true),
            ("Delivered-To", false),
        ];
        if let Some(msg) = message {
            for (name, strip_rfc822) in header_sources {
                if let Some(value) = header_text(msg, name) {
                    let value = if strip_rfc822 {
                        value
                            .split_once(';')
                            .map(|(_, rest)| rest)
                            .unwrap_or(&value)
                            .to_string()
                    } else {
                        value
                    };
                    if let Some(addr) = self.accept_address(value.trim()) {
                        return addr;
                    }
                }
            }
        }

        // The loose to:/recipient: pattern is restricted to the body; the
        // top-level To: header is the bounce mailbox, not the bounced
        // recipient.
        let body = body_of(text);
        for (re, haystack) in [
            (&self.final_recipient_re, text),
            (&self.original_recipient_re, text),
            (&self.loose_recipient_re, body),
        ] {
            for caps in re.captures_iter(haystack) {
                if let Some(addr) = caps.get(1).and_then(|m| self.accept_address(m.as_str())) {
                    return addr;
                }
            }
        }

        String::new()
    }

    fn accept_address(&self, candidate: &str) -> Option<String> {
        let addr = candidate.trim().trim_matches(['<', '>']).to_lowercase();
        if addr.contains('@') && addr != self.mailbox_addr {
            Some(addr)
        } else {
            None
        }
    }

    fn extract_campaign_uuid(
        &self,
        message: Option<&mail_parser::Message>,
        text: &str,
    ) -> Option<Uuid> {
        if let Some(uuid) = self.header_uuid(message, CAMPAIGN_UUID_HEADER) {
            return Some(uuid);
        }
        if let Some(uuid) = self.body_uuid(&self.campaign_header_re, text) {
            return Some(uuid);
        }
        self.keyword_uuid(text)
    }

    fn extract_subscriber_uuid(
        &self,
        message: Option<&mail_parser::Message>,
        text: &str,
    ) -> Option<Uuid> {
        if let Some(uuid) = self.header_uuid(message, SUBSCRIBER_UUID_HEADER) {
            return Some(uuid);
        }
        self.body_uuid(&self.subscriber_header_re, text)
    }

    fn header_uuid(&self, message: Option<&mail_parser::Message>, name: &str) -> Option<Uuid> {
        let msg = message?;
        let value = header_text(msg, name)?;
        valid_v4_uuid(&value)
    }

    fn body_uuid(&self, re: &Regex, text: &str) -> Option<Uuid> {
        re.captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .find_map(|m| valid_v4_uuid(m.as_str()))
    }

    /// Last-resort campaign uuid: any v4 uuid within the window after one
    /// of the campaign keywords.
    fn keyword_uuid(&self, text: &str) -> Option<Uuid> {
        let lower = text.to_lowercase();
        for keyword in CAMPAIGN_KEYWORDS {
            for (idx, _) in lower.match_indices(keyword) {
                let window: String = lower[idx..]
                    .chars()
                    .take(keyword.len() + KEYWORD_WINDOW)
                    .collect();
                if let Some(uuid) = self.body_uuid(&self.uuid_re, &window) {
                    return Some(uuid);
                }
            }
        }
        None
    }
}

/// The message text after the header block
fn body_of(text: &str) -> &str {
    if let Some(idx) = text.find("\r\n\r\n") {
        &text[idx + 4..]
    } else if let Some(idx) = text.find("\n\n") {
        &text[idx + 2..]
    } else {
        text
    }
}

fn header_text(msg: &mail_parser::Message, name: &str) -> Option<String> {
    msg.header(name)
        .and_then(|h| h.as_text())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAMPAIGN_UUID: &str = "550e8400-e29b-41d4-a716-446655440000";
    const SUBSCRIBER_UUID: &str = "6ba7b810-9dad-41d1-80b4-00c04fd430c8";

    fn parser() -> BounceParser {
        BounceParser::new("bounce@news.example.com")
    }

    fn dsn_with_headers() -> Vec<u8> {
        format!(
            "From: MAILER-DAEMON <mailer-daemon@mx.example.net>\r\n\
             To: bounce@news.example.com\r\n\
             Subject: Undelivered Mail Returned to Sender\r\n\
             Message-ID: <abc123@mx.example.net>\r\n\
             X-Listmonk-Campaign: {}\r\n\
             X-Listmonk-Subscriber: {}\r\n\
             \r\n\
             This is the mail system.\r\n\
             Final-Recipient: rfc822; bob@destination.com\r\n\
             Status: 5.1.1\r\n",
            CAMPAIGN_UUID, SUBSCRIBER_UUID
        )
        .into_bytes()
    }

    #[test]
    fn test_extracts_from_headers() {
        let parsed = parser().parse(&dsn_with_headers());
        assert_eq!(parsed.email, "bob@destination.com");
        assert_eq!(parsed.campaign_uuid.unwrap().to_string(), CAMPAIGN_UUID);
        assert_eq!(parsed.subscriber_uuid.unwrap().to_string(), SUBSCRIBER_UUID);
        assert_eq!(parsed.meta["subject"], "Undelivered Mail Returned to Sender");
    }

    #[test]
    fn test_mailbox_address_is_never_the_recipient() {
        let raw = b"From: daemon@mx.example.net\r\n\
            To: someone@else.example\r\n\
            \r\n\
            Delivered-To: bounce@news.example.com\r\n\
            To: carol@destination.com\r\n"
            .to_vec();
        let parsed = parser().parse(&raw);
        assert_eq!(parsed.email, "carol@destination.com");
    }

    #[test]
    fn test_invalid_header_uuid_falls_back_to_body_keyword() {
        let raw = format!(
            "From: daemon@mx.example.net\r\n\
             X-Listmonk-Campaign: not-a-uuid\r\n\
             \r\n\
             Your message could not be delivered.\r\n\
             Campaign ID: {}\r\n",
            CAMPAIGN_UUID
        )
        .into_bytes();

        let parsed = parser().parse(&raw);
        assert_eq!(parsed.campaign_uuid.unwrap().to_string(), CAMPAIGN_UUID);
    }

    #[test]
    fn test_non_v4_uuid_is_rejected() {
        // Version-1 uuid in the subscriber header must normalize to none.
        let raw = b"From: daemon@mx.example.net\r\n\
            X-Listmonk-Subscriber: 550e8400-e29b-11d4-a716-446655440000\r\n\
            \r\n\
            body\r\n"
            .to_vec();
        let parsed = parser().parse(&raw);
        assert_eq!(parsed.subscriber_uuid, None);
    }

    #[test]
    fn test_uuid_outside_keyword_window_is_ignored() {
        let filler = "x".repeat(300);
        let raw = format!(
            "From: daemon@mx.example.net\r\n\
             \r\n\
             campaign {} {}\r\n",
            filler, CAMPAIGN_UUID
        )
        .into_bytes();
        let parsed = parser().parse(&raw);
        assert_eq!(parsed.campaign_uuid, None);
    }

    #[test]
    fn test_labeled_body_header_beats_keyword_fallback() {
        let other = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
        let raw = format!(
            "From: daemon@mx.example.net\r\n\
             \r\n\
             The campaign {} did not go through.\r\n\
             X-Listmonk-Campaign: {}\r\n",
            other, CAMPAIGN_UUID
        )
        .into_bytes();
        let parsed = parser().parse(&raw);
        // The labeled header copy in the body is higher confidence than a
        // uuid loitering near the word "campaign".
        assert_eq!(parsed.campaign_uuid.unwrap().to_string(), CAMPAIGN_UUID);
    }
}
