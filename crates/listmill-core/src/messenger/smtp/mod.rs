//! SMTP messenger
//!
//! Delivers rendered campaign messages through one or more configured SMTP
//! servers, each behind its own bounded connection pool. A uniformly random
//! server is chosen per push. The envelope sender and visible From are
//! rewritten to the authenticated account where required for
//! deliverability, preserving the original From in Reply-To.

mod auth;
pub(crate) mod client;
mod pool;

use crate::messenger::{Messenger, OutgoingMessage};
use crate::netio;
use async_trait::async_trait;
use chrono::Utc;
use client::SmtpConnection;
use listmill_common::config::SmtpServerConfig;
use listmill_common::types::{AuthProtocol, TlsType};
use mail_builder::headers::raw::Raw;
use mail_builder::MessageBuilder;
use pool::ConnectionPool;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// SMTP messenger errors
#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("SMTP configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Timed out waiting for a free connection")]
    PoolTimeout,

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("TLS required but not configured")]
    TlsNotConfigured,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{command} rejected with {code}: {text}")]
    Rejected {
        command: &'static str,
        code: u16,
        text: String,
    },

    #[error("Server closed the connection")]
    ConnectionClosed,
}

struct Server {
    cfg: SmtpServerConfig,
    /// Password with all whitespace stripped (app passwords are often
    /// pasted with grouping spaces)
    password: String,
    tls: Option<TlsConnector>,
    pool: ConnectionPool,
}

/// Messenger delivering through a set of SMTP servers
pub struct SmtpMessenger {
    name: String,
    servers: Vec<Server>,
    /// Host fragment for generated Message-IDs; falls back per-server host
    message_id_host: Option<String>,
}

impl SmtpMessenger {
    /// Build a messenger from the enabled server configurations.
    pub fn new(
        name: impl Into<String>,
        configs: Vec<SmtpServerConfig>,
        public_hostname: Option<String>,
    ) -> Result<Self, SmtpError> {
        let mut servers = Vec::new();

        for cfg in configs.into_iter().filter(|c| c.enabled) {
            if cfg.host.is_empty() {
                return Err(SmtpError::Config("Server host must not be empty".to_string()));
            }
            if cfg.auth_protocol != AuthProtocol::None && cfg.username.is_empty() {
                return Err(SmtpError::Config(format!(
                    "Server {} requires a username for {:?} auth",
                    cfg.host, cfg.auth_protocol
                )));
            }

            let password: String = cfg.password.chars().filter(|c| !c.is_whitespace()).collect();
            let tls = match cfg.tls_type {
                TlsType::None => None,
                TlsType::Tls | TlsType::Starttls => {
                    Some(netio::tls_connector(cfg.tls_skip_verify))
                }
            };
            let pool = ConnectionPool::new(
                cfg.max_conns,
                Duration::from_secs(cfg.idle_timeout_secs),
                Duration::from_secs(cfg.wait_timeout_secs),
            );

            info!(host = %cfg.host, port = cfg.port, max_conns = cfg.max_conns, "Configured SMTP server");
            servers.push(Server {
                cfg,
                password,
                tls,
                pool,
            });
        }

        if servers.is_empty() {
            return Err(SmtpError::Config(
                "At least one enabled SMTP server is required".to_string(),
            ));
        }

        Ok(Self {
            name: name.into(),
            servers,
            message_id_host: public_hostname,
        })
    }

    fn pick(&self) -> &Server {
        if self.servers.len() == 1 {
            &self.servers[0]
        } else {
            let idx = rand::thread_rng().gen_range(0..self.servers.len());
            &self.servers[idx]
        }
    }
}

#[async_trait]
impl Messenger for SmtpMessenger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, msg: OutgoingMessage) -> anyhow::Result<()> {
        let server = self.pick();
        let envelope = rewrite_envelope(&msg.from, &server.cfg.username);
        if envelope.mail_from.is_empty() {
            anyhow::bail!(
                "No envelope sender could be derived from {:?} with account {:?}",
                msg.from,
                server.cfg.username
            );
        }

        let host = self
            .message_id_host
            .as_deref()
            .unwrap_or(server.cfg.host.as_str());
        let mime = build_mime(&msg, &envelope, &server.cfg, host)?;

        let (mut conn, permit) = match server.pool.acquire().await? {
            Ok(lease) => {
                let (mut conn, permit) = lease.into_parts();
                // A reused session gets its state reset; a dead one is
                // replaced under the same slot.
                match conn.reset().await {
                    Ok(()) => (conn, permit),
                    Err(e) => {
                        debug!(host = %server.cfg.host, "Pooled SMTP session dead ({}), reconnecting", e);
                        let conn =
                            SmtpConnection::open(&server.cfg, &server.password, server.tls.as_ref())
                                .await?;
                        (conn, permit)
                    }
                }
            }
            Err(permit) => {
                let conn =
                    SmtpConnection::open(&server.cfg, &server.password, server.tls.as_ref())
                        .await?;
                (conn, permit)
            }
        };

        match conn.send(&envelope.mail_from, &msg.to, &mime).await {
            Ok(()) => {
                server.pool.release(ConnectionPool::lease(conn, permit)).await;
                Ok(())
            }
            // The connection is dropped for reset; the permit frees with it.
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        for server in &self.servers {
            server.pool.close().await;
        }
        Ok(())
    }
}

/// Rewritten sender identity for one outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Envelope {
    /// MAIL FROM argument
    pub mail_from: String,
    /// Visible From header value
    pub from_header: String,
    /// Set when the visible From was rewritten away from the original
    pub reply_to: Option<String>,
}

/// Rewrite the envelope and visible From against the authenticated
/// account. Relays commonly reject mail whose MAIL FROM or From does not
/// match the account, so when the username is itself an address it becomes
/// the envelope sender and, unless already present in From, replaces the
/// From address while the original moves to Reply-To.
pub(crate) fn rewrite_envelope(original_from: &str, username: &str) -> Envelope {
    if !username.contains('@') {
        return Envelope {
            mail_from: address_of(original_from).unwrap_or_default(),
            from_header: original_from.to_string(),
            reply_to: None,
        };
    }

    if original_from.contains(username) {
        return Envelope {
            mail_from: username.to_string(),
            from_header: original_from.to_string(),
            reply_to: None,
        };
    }

    let from_header = match display_name_of(original_from) {
        Some(name) => format!("\"{}\" <{}>", name, username),
        None => format!("<{}>", username),
    };

    Envelope {
        mail_from: username.to_string(),
        from_header,
        reply_to: Some(original_from.to_string()),
    }
}

/// Address part of an RFC 5322 mailbox ("Name <a@b>" or bare "a@b")
fn address_of(mailbox: &str) -> Option<String> {
    if let Some(start) = mailbox.rfind('<') {
        let rest = &mailbox[start + 1..];
        return rest.find('>').map(|end| rest[..end].trim().to_string());
    }
    let bare = mailbox.trim();
    if bare.contains('@') {
        Some(bare.to_string())
    } else {
        None
    }
}

/// Display-name part of an RFC 5322 mailbox, if any
fn display_name_of(mailbox: &str) -> Option<String> {
    let start = mailbox.rfind('<')?;
    let name = mailbox[..start].trim().trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Assemble the RFC 5322 / MIME bytes for one message.
fn build_mime(
    msg: &OutgoingMessage,
    envelope: &Envelope,
    server: &SmtpServerConfig,
    message_id_host: &str,
) -> anyhow::Result<Vec<u8>> {
    let now = Utc::now();
    let mut builder = MessageBuilder::new()
        .header("From", Raw::new(envelope.from_header.clone()))
        .header("To", Raw::new(msg.to.join(", ")))
        .subject(msg.subject.as_str())
        .header("MIME-Version", Raw::new("1.0"))
        .header("Date", Raw::new(now.to_rfc2822()))
        .header(
            "Message-ID",
            Raw::new(format!(
                "<{}.listmill@{}>",
                now.timestamp_nanos_opt().unwrap_or_default(),
                message_id_host
            )),
        );

    if let Some(reply_to) = &envelope.reply_to {
        builder = builder.header("Reply-To", Raw::new(reply_to.clone()));
    }

    for (key, value) in &server.email_headers {
        builder = builder.header(key.clone(), Raw::new(value.clone()));
    }
    for (key, value) in &msg.headers {
        builder = builder.header(key.clone(), Raw::new(value.clone()));
    }

    let builder = if msg.content_type.is_html() {
        builder.html_body(msg.body.as_str())
    } else {
        builder.text_body(msg.body.as_str())
    };

    builder
        .write_to_vec()
        .map_err(|e| anyhow::anyhow!("Failed to encode message: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use listmill_common::types::ContentType;

    #[test]
    fn test_rewrite_to_authenticated_account() {
        let env = rewrite_envelope("\"Alice\" <alice@example.org>", "user@gmail.com");
        assert_eq!(env.mail_from, "user@gmail.com");
        assert_eq!(env.from_header, "\"Alice\" <user@gmail.com>");
        assert_eq!(env.reply_to.as_deref(), Some("\"Alice\" <alice@example.org>"));
    }

    #[test]
    fn test_rewrite_keeps_matching_from() {
        let env = rewrite_envelope("\"News\" <user@gmail.com>", "user@gmail.com");
        assert_eq!(env.mail_from, "user@gmail.com");
        assert_eq!(env.from_header, "\"News\" <user@gmail.com>");
        assert_eq!(env.reply_to, None);
    }

    #[test]
    fn test_rewrite_without_display_name() {
        let env = rewrite_envelope("alice@example.org", "user@gmail.com");
        assert_eq!(env.mail_from, "user@gmail.com");
        assert_eq!(env.from_header, "<user@gmail.com>");
        assert_eq!(env.reply_to.as_deref(), Some("alice@example.org"));
    }

    #[test]
    fn test_rewrite_when_username_is_not_an_address() {
        let env = rewrite_envelope("\"Alice\" <alice@example.org>", "relayuser");
        assert_eq!(env.mail_from, "alice@example.org");
        assert_eq!(env.from_header, "\"Alice\" <alice@example.org>");
        assert_eq!(env.reply_to, None);
    }

    #[test]
    fn test_password_whitespace_stripped() {
        let cfg = SmtpServerConfig {
            enabled: true,
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "user@example.com".to_string(),
            password: "abcd efgh ijkl mnop".to_string(),
            auth_protocol: AuthProtocol::Plain,
            tls_type: TlsType::None,
            tls_skip_verify: false,
            max_conns: 2,
            idle_timeout_secs: 15,
            wait_timeout_secs: 5,
            hello_hostname: None,
            email_headers: Default::default(),
        };

        let messenger = SmtpMessenger::new("email", vec![cfg], None).unwrap();
        assert_eq!(messenger.servers[0].password, "abcdefghijklmnop");
    }

    #[test]
    fn test_new_rejects_empty_server_set() {
        assert!(matches!(
            SmtpMessenger::new("email", vec![], None),
            Err(SmtpError::Config(_))
        ));
    }

    #[test]
    fn test_build_mime_headers() {
        let msg = OutgoingMessage {
            from: "\"Alice\" <alice@example.org>".to_string(),
            to: vec!["bob@x.com".to_string()],
            subject: "Hello".to_string(),
            body: "<p>Hi</p>".to_string(),
            content_type: ContentType::Html,
            headers: vec![(
                "X-Listmonk-Campaign".to_string(),
                "550e8400-e29b-41d4-a716-446655440000".to_string(),
            )],
        };
        let envelope = rewrite_envelope(&msg.from, "user@gmail.com");
        let server = SmtpServerConfig {
            enabled: true,
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "user@gmail.com".to_string(),
            password: String::new(),
            auth_protocol: AuthProtocol::None,
            tls_type: TlsType::None,
            tls_skip_verify: false,
            max_conns: 2,
            idle_timeout_secs: 15,
            wait_timeout_secs: 5,
            hello_hostname: None,
            email_headers: [("X-Mailer".to_string(), "listmill".to_string())].into(),
        };

        let bytes = build_mime(&msg, &envelope, &server, "news.example.com").unwrap();
        let text = String::from_utf8_lossy(&bytes);

        assert!(text.contains("From: \"Alice\" <user@gmail.com>"));
        assert!(text.contains("Reply-To: \"Alice\" <alice@example.org>"));
        assert!(text.contains("To: bob@x.com"));
        assert!(text.contains("MIME-Version: 1.0"));
        assert!(text.contains(".listmill@news.example.com>"));
        assert!(text.contains("X-Mailer: listmill"));
        assert!(text.contains("X-Listmonk-Campaign: 550e8400-e29b-41d4-a716-446655440000"));
        assert!(text.contains("Content-Type: text/html"));
    }
}
