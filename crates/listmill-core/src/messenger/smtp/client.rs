//! RFC 5321 client speaker
//!
//! A line-oriented SMTP client over plain TCP or rustls: greeting, EHLO,
//! STARTTLS upgrade, AUTH, then MAIL FROM / RCPT TO / DATA per message.
//! Failure at any stage surfaces as an error and the connection is
//! discarded by the pool.

use super::auth;
use super::SmtpError;
use crate::netio::{self, AsyncStream};
use listmill_common::config::SmtpServerConfig;
use listmill_common::types::{AuthProtocol, TlsType};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed SMTP reply, possibly multiline
#[derive(Debug)]
pub(crate) struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Text of the final reply line, without the status code
    pub fn text(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }
}

/// One authenticated SMTP session
pub(crate) struct SmtpConnection {
    stream: BufStream<Box<dyn AsyncStream>>,
    host: String,
}

impl SmtpConnection {
    /// Connect, upgrade to TLS per the server's mode, and authenticate.
    pub async fn open(
        cfg: &SmtpServerConfig,
        password: &str,
        tls: Option<&TlsConnector>,
    ) -> Result<Self, SmtpError> {
        let tcp = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((cfg.host.as_str(), cfg.port)),
        )
        .await
        .map_err(|_| SmtpError::Timeout("connect"))??;
        tcp.set_nodelay(true)?;

        let stream: Box<dyn AsyncStream> = match cfg.tls_type {
            TlsType::Tls => {
                let connector = tls.ok_or(SmtpError::TlsNotConfigured)?;
                let name = netio::server_name(&cfg.host)
                    .map_err(|e| SmtpError::Tls(e.to_string()))?;
                Box::new(
                    connector
                        .connect(name, tcp)
                        .await
                        .map_err(|e| SmtpError::Tls(e.to_string()))?,
                )
            }
            _ => Box::new(tcp),
        };

        let mut conn = Self {
            stream: BufStream::new(stream),
            host: cfg.host.clone(),
        };

        conn.expect_reply(220).await?;

        let hello = cfg.hello_hostname.as_deref().unwrap_or("localhost");
        conn.ehlo(hello).await?;

        if cfg.tls_type == TlsType::Starttls {
            let connector = tls.ok_or(SmtpError::TlsNotConfigured)?;
            conn.starttls(connector).await?;
            // The session state resets across the upgrade.
            conn.ehlo(hello).await?;
        }

        conn.authenticate(cfg, password).await?;

        debug!(host = %cfg.host, port = cfg.port, "SMTP session established");
        Ok(conn)
    }

    async fn ehlo(&mut self, hello: &str) -> Result<(), SmtpError> {
        self.command(&format!("EHLO {}", hello), 250).await?;
        Ok(())
    }

    async fn starttls(&mut self, connector: &TlsConnector) -> Result<(), SmtpError> {
        self.command("STARTTLS", 220).await?;

        let name = netio::server_name(&self.host).map_err(|e| SmtpError::Tls(e.to_string()))?;
        let plain = std::mem::replace(
            &mut self.stream,
            BufStream::new(Box::new(tokio::io::empty()) as Box<dyn AsyncStream>),
        )
        .into_inner();

        let upgraded = connector
            .connect(name, plain)
            .await
            .map_err(|e| SmtpError::Tls(e.to_string()))?;
        self.stream = BufStream::new(Box::new(upgraded));
        Ok(())
    }

    async fn authenticate(
        &mut self,
        cfg: &SmtpServerConfig,
        password: &str,
    ) -> Result<(), SmtpError> {
        match cfg.auth_protocol {
            AuthProtocol::None => Ok(()),
            AuthProtocol::Plain => {
                let payload = auth::plain_response(&cfg.username, password);
                self.command(&format!("AUTH PLAIN {}", payload), 235).await?;
                Ok(())
            }
            AuthProtocol::Login => {
                self.command("AUTH LOGIN", 334).await?;
                self.command(&auth::login_response(&cfg.username), 334).await?;
                self.command(&auth::login_response(password), 235).await?;
                Ok(())
            }
            AuthProtocol::Cram => {
                let reply = self.command("AUTH CRAM-MD5", 334).await?;
                let challenge = auth::decode_challenge(reply.text())
                    .ok_or_else(|| SmtpError::Auth("Malformed CRAM-MD5 challenge".to_string()))?;
                let response = auth::cram_md5_response(&cfg.username, password, &challenge);
                self.command(&response, 235).await?;
                Ok(())
            }
        }
    }

    /// Submit one message: MAIL FROM, RCPT TO per recipient, DATA.
    pub async fn send(
        &mut self,
        envelope_from: &str,
        rcpts: &[String],
        data: &[u8],
    ) -> Result<(), SmtpError> {
        self.command(&format!("MAIL FROM:<{}>", envelope_from), 250)
            .await?;

        for rcpt in rcpts {
            let reply = self.command_raw(&format!("RCPT TO:<{}>", rcpt)).await?;
            if reply.code != 250 && reply.code != 251 {
                return Err(SmtpError::Rejected {
                    command: "RCPT TO",
                    code: reply.code,
                    text: reply.text().to_string(),
                });
            }
        }

        self.command("DATA", 354).await?;
        self.write_data(data).await?;
        self.expect_reply(250).await?;
        Ok(())
    }

    /// Reset session state between messages on a pooled connection
    pub async fn reset(&mut self) -> Result<(), SmtpError> {
        self.command("RSET", 250).await?;
        Ok(())
    }

    /// Close the session politely; errors are ignored, the socket is
    /// dropped either way.
    pub async fn quit(mut self) {
        let _ = tokio::time::timeout(IO_TIMEOUT, async {
            let _ = self.write_line("QUIT").await;
            let _ = self.read_reply().await;
        })
        .await;
    }

    async fn command(&mut self, line: &str, expected: u16) -> Result<Reply, SmtpError> {
        let reply = self.command_raw(line).await?;
        if reply.code != expected {
            return Err(SmtpError::Rejected {
                command: command_verb(line),
                code: reply.code,
                text: reply.text().to_string(),
            });
        }
        Ok(reply)
    }

    async fn command_raw(&mut self, line: &str) -> Result<Reply, SmtpError> {
        self.write_line(line).await?;
        self.read_reply().await
    }

    async fn expect_reply(&mut self, expected: u16) -> Result<Reply, SmtpError> {
        let reply = self.read_reply().await?;
        if reply.code != expected {
            return Err(SmtpError::Rejected {
                command: "reply",
                code: reply.code,
                text: reply.text().to_string(),
            });
        }
        Ok(reply)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SmtpError> {
        trace!(line, "smtp >>");
        tokio::time::timeout(IO_TIMEOUT, async {
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| SmtpError::Timeout("write"))??;
        Ok(())
    }

    /// Write the message body with dot-stuffing and the terminating dot.
    async fn write_data(&mut self, data: &[u8]) -> Result<(), SmtpError> {
        let stuffed = dot_stuff(data);
        tokio::time::timeout(IO_TIMEOUT, async {
            self.stream.write_all(&stuffed).await?;
            if !stuffed.ends_with(b"\r\n") {
                self.stream.write_all(b"\r\n").await?;
            }
            self.stream.write_all(b".\r\n").await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| SmtpError::Timeout("data"))??;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply, SmtpError> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::Timeout("read"))??;
            if n == 0 {
                return Err(SmtpError::ConnectionClosed);
            }

            let line = line.trim_end_matches(['\r', '\n']).to_string();
            trace!(line = %line, "smtp <<");
            if line.len() < 4 {
                // Bare "XYZ" final line with no text.
                let code = parse_code(&line)?;
                lines.push(String::new());
                return Ok(Reply { code, lines });
            }

            let code = parse_code(&line[..3])?;
            let cont = line.as_bytes()[3] == b'-';
            lines.push(line[4..].to_string());

            if !cont {
                return Ok(Reply { code, lines });
            }
        }
    }
}

fn parse_code(s: &str) -> Result<u16, SmtpError> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| SmtpError::Protocol(format!("Unparsable reply code: {:?}", s)))
}

/// First word of a command line, for error context without echoing
/// credentials.
fn command_verb(line: &str) -> &'static str {
    let verb = line.split_whitespace().next().unwrap_or("");
    match verb.to_ascii_uppercase().as_str() {
        "EHLO" => "EHLO",
        "HELO" => "HELO",
        "STARTTLS" => "STARTTLS",
        "AUTH" => "AUTH",
        "MAIL" => "MAIL FROM",
        "RCPT" => "RCPT TO",
        "DATA" => "DATA",
        "RSET" => "RSET",
        "QUIT" => "QUIT",
        _ => "command",
    }
}

/// Duplicate leading dots per RFC 5321 §4.5.2 and normalize line endings
/// to CRLF.
pub(crate) fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut at_line_start = true;

    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        match b {
            b'.' if at_line_start => {
                out.extend_from_slice(b"..");
                at_line_start = false;
            }
            b'\r' => {
                // Swallow; the matching \n (or lack of one) emits CRLF.
                if i + 1 >= data.len() || data[i + 1] != b'\n' {
                    out.extend_from_slice(b"\r\n");
                    at_line_start = true;
                }
            }
            b'\n' => {
                out.extend_from_slice(b"\r\n");
                at_line_start = true;
            }
            other => {
                out.push(other);
                at_line_start = false;
            }
        }
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(dot_stuff(b"hello\r\n.world\r\n"), b"hello\r\n..world\r\n");
        assert_eq!(dot_stuff(b".\r\n"), b"..\r\n");
        assert_eq!(dot_stuff(b"a.b\r\n"), b"a.b\r\n");
    }

    #[test]
    fn test_dot_stuff_normalizes_line_endings() {
        assert_eq!(dot_stuff(b"a\nb\n"), b"a\r\nb\r\n");
        assert_eq!(dot_stuff(b"a\rb"), b"a\r\nb");
    }

    #[test]
    fn test_parse_code() {
        assert_eq!(parse_code("250").unwrap(), 250);
        assert!(parse_code("xyz").is_err());
    }

    #[test]
    fn test_command_verb_hides_arguments() {
        assert_eq!(command_verb("AUTH PLAIN c2VjcmV0"), "AUTH");
        assert_eq!(command_verb("MAIL FROM:<a@b>"), "MAIL FROM");
        assert_eq!(command_verb("XUNKNOWN"), "command");
    }
}
