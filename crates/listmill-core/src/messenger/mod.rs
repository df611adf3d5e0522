//! Messenger backends
//!
//! A messenger accepts a fully rendered message and delivers it. The SMTP
//! messenger is the primary backend; the manager resolves messengers by
//! name per campaign.

pub mod smtp;

use async_trait::async_trait;
use listmill_common::types::ContentType;

/// Header carrying the campaign uuid on outgoing mail and on bounces.
/// These names are the established wire contract that bounce processing
/// and downstream tooling key on.
pub const CAMPAIGN_UUID_HEADER: &str = "X-Listmonk-Campaign";

/// Header carrying the subscriber uuid on outgoing mail and on bounces.
pub const SUBSCRIBER_UUID_HEADER: &str = "X-Listmonk-Subscriber";

/// A rendered message bound for one recipient set
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// RFC 5322 From value; may carry a display name
    pub from: String,
    /// Recipient addresses
    pub to: Vec<String>,
    pub subject: String,
    /// Rendered body; HTML or plain text per `content_type`
    pub body: String,
    pub content_type: ContentType,
    /// Additional headers, appended after the standard set
    pub headers: Vec<(String, String)>,
}

/// A pluggable delivery backend. Implementations are thread-safe; `push`
/// is synchronous delivery and blocks until the message is accepted by the
/// upstream or an error occurs.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Registry name, referenced by campaigns
    fn name(&self) -> &str;

    /// Deliver one message
    async fn push(&self, msg: OutgoingMessage) -> anyhow::Result<()>;

    /// Flush any buffered state
    async fn flush(&self) -> anyhow::Result<()>;

    /// Tear down connections
    async fn close(&self) -> anyhow::Result<()>;
}
