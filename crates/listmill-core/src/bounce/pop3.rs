//! RFC 1939 client for bounce mailboxes
//!
//! Minimal POP3 speaker: greeting, USER/PASS or APOP authentication,
//! STAT, RETR with dot-unstuffing, DELE, QUIT. Connections are one-shot
//! per scan cycle.

use crate::netio::{self, AsyncStream};
use listmill_common::config::BounceMailboxConfig;
use listmill_common::types::MailboxAuth;
use md5::{Digest, Md5};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tracing::{debug, trace};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// POP3 client errors
#[derive(Error, Debug)]
pub enum Pop3Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Server error: {0}")]
    Err(String),

    #[error("APOP requested but the server sent no timestamp banner")]
    ApopUnsupported,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server closed the connection")]
    ConnectionClosed,
}

/// One POP3 session
pub(crate) struct Pop3Client {
    stream: BufStream<Box<dyn AsyncStream>>,
    /// `<...>` timestamp from the greeting, present when APOP is offered
    apop_banner: Option<String>,
}

impl Pop3Client {
    /// Connect and read the greeting.
    pub async fn connect(cfg: &BounceMailboxConfig) -> Result<Self, Pop3Error> {
        let connector = cfg
            .tls_enabled
            .then(|| netio::tls_connector(cfg.tls_skip_verify));

        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            netio::open_stream(&cfg.host, cfg.port, connector.as_ref()),
        )
        .await
        .map_err(|_| Pop3Error::Timeout("connect"))??;

        let mut client = Self {
            stream: BufStream::new(stream),
            apop_banner: None,
        };

        let greeting = client.read_response().await?;
        client.apop_banner = extract_banner(&greeting);

        debug!(host = %cfg.host, port = cfg.port, "POP3 session established");
        Ok(client)
    }

    /// Authenticate per the mailbox configuration.
    pub async fn login(&mut self, cfg: &BounceMailboxConfig) -> Result<(), Pop3Error> {
        match cfg.auth_protocol {
            MailboxAuth::None => Ok(()),
            MailboxAuth::Userpass => {
                self.command(&format!("USER {}", cfg.username)).await?;
                self.command(&format!("PASS {}", cfg.password)).await?;
                Ok(())
            }
            MailboxAuth::Apop => {
                let banner = self
                    .apop_banner
                    .clone()
                    .ok_or(Pop3Error::ApopUnsupported)?;
                let digest = apop_digest(&banner, &cfg.password);
                self.command(&format!("APOP {} {}", cfg.username, digest))
                    .await?;
                Ok(())
            }
        }
    }

    /// Message count and total size
    pub async fn stat(&mut self) -> Result<(usize, u64), Pop3Error> {
        let response = self.command("STAT").await?;
        let mut parts = response.split_whitespace();
        let count = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Pop3Error::Protocol(format!("Bad STAT response: {:?}", response)))?;
        let size = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok((count, size))
    }

    /// Download one message (1-indexed)
    pub async fn retr(&mut self, number: usize) -> Result<Vec<u8>, Pop3Error> {
        self.command(&format!("RETR {}", number)).await?;
        self.read_multiline().await
    }

    /// Mark one message for deletion
    pub async fn dele(&mut self, number: usize) -> Result<(), Pop3Error> {
        self.command(&format!("DELE {}", number)).await?;
        Ok(())
    }

    /// Commit deletions and close
    pub async fn quit(mut self) -> Result<(), Pop3Error> {
        self.command("QUIT").await?;
        Ok(())
    }

    /// Send one command and expect a +OK response; the text after +OK is
    /// returned.
    async fn command(&mut self, line: &str) -> Result<String, Pop3Error> {
        trace!(verb = line.split_whitespace().next().unwrap_or(""), "pop3 >>");
        tokio::time::timeout(IO_TIMEOUT, async {
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| Pop3Error::Timeout("write"))??;

        self.read_response().await
    }

    /// Read a single status line; -ERR maps to an error.
    async fn read_response(&mut self) -> Result<String, Pop3Error> {
        let mut line = String::new();
        let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_line(&mut line))
            .await
            .map_err(|_| Pop3Error::Timeout("read"))??;
        if n == 0 {
            return Err(Pop3Error::ConnectionClosed);
        }

        let line = line.trim_end_matches(['\r', '\n']);
        trace!(line, "pop3 <<");

        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim_start().to_string())
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            Err(Pop3Error::Err(rest.trim_start().to_string()))
        } else {
            Err(Pop3Error::Protocol(format!(
                "Unexpected response: {:?}",
                line
            )))
        }
    }

    /// Read a multiline payload up to the lone-dot terminator, undoing
    /// dot-stuffing.
    async fn read_multiline(&mut self) -> Result<Vec<u8>, Pop3Error> {
        let mut out = Vec::new();

        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_line(&mut line))
                .await
                .map_err(|_| Pop3Error::Timeout("read"))??;
            if n == 0 {
                return Err(Pop3Error::ConnectionClosed);
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == "." {
                return Ok(out);
            }

            // Undo byte-stuffing: a leading dot was doubled on the wire.
            let content = trimmed.strip_prefix('.').unwrap_or(trimmed);
            out.extend_from_slice(content.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// `<...>` timestamp banner from the greeting, if present
fn extract_banner(greeting: &str) -> Option<String> {
    let start = greeting.find('<')?;
    let end = greeting[start..].find('>')? + start;
    Some(greeting[start..=end].to_string())
}

/// APOP digest: md5 hex of the banner concatenated with the password
pub(crate) fn apop_digest(banner: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(banner.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}
