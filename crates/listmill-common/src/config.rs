//! Configuration for listmill

use crate::types::{AuthProtocol, BounceAction, MailboxAuth, TlsType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server-wide settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Campaign engine configuration
    #[serde(default)]
    pub campaign: CampaignConfig,

    /// Outbound SMTP servers
    #[serde(default)]
    pub smtp: Vec<SmtpServerConfig>,

    /// Bounce processing configuration
    #[serde(default)]
    pub bounce: BounceConfig,

    /// Status notification configuration
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Public hostname, used for Message-ID generation. Falls back to the
    /// SMTP server host when unset.
    pub hostname: Option<String>,

    /// Public base URL for unsubscribe links and tracking pixels
    #[serde(default = "default_root_url")]
    pub root_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            root_url: default_root_url(),
        }
    }
}

fn default_root_url() -> String {
    "http://localhost:9000".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Campaign engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Number of concurrent send workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum subscribers fetched per batch; also sizes the queues
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Send-error threshold that auto-pauses a campaign; 0 disables
    #[serde(default)]
    pub max_send_errors: u64,

    /// Global sliding-window limiter
    #[serde(default)]
    pub sliding_window: bool,

    /// Messages allowed per sliding window
    #[serde(default)]
    pub sliding_window_rate: u64,

    /// Sliding window length in seconds
    #[serde(default)]
    pub sliding_window_duration_secs: u64,

    /// Legacy per-worker rate hint; carried for config compatibility but
    /// not consulted by the scheduler
    #[serde(default)]
    pub message_rate: usize,

    /// Default From address for campaigns that omit one
    #[serde(default = "default_from_email")]
    pub from_email: String,

    /// Interval between storage scans for newly running campaigns, seconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            max_send_errors: 0,
            sliding_window: false,
            sliding_window_rate: 0,
            sliding_window_duration_secs: 0,
            message_rate: 0,
            from_email: default_from_email(),
            scan_interval_secs: default_scan_interval(),
        }
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_batch_size() -> usize {
    1000
}

fn default_from_email() -> String {
    "listmill <noreply@localhost>".to_string()
}

fn default_scan_interval() -> u64 {
    5
}

/// A single outbound SMTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpServerConfig {
    /// Whether this server participates in sending
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Server host
    pub host: String,

    /// Server port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Username; when it is an address it becomes the envelope sender
    #[serde(default)]
    pub username: String,

    /// Password; surrounding/internal spaces are stripped before use
    #[serde(default)]
    pub password: String,

    /// Authentication protocol
    #[serde(default)]
    pub auth_protocol: AuthProtocol,

    /// TLS mode
    #[serde(default)]
    pub tls_type: TlsType,

    /// Skip server certificate verification
    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Maximum pooled connections
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// Seconds an idle pooled connection is kept alive
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds a send waits for a free connection before erroring
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Hostname announced in EHLO
    pub hello_hostname: Option<String>,

    /// Static headers attached to every message sent through this server
    #[serde(default)]
    pub email_headers: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

fn default_max_conns() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    15
}

fn default_wait_timeout() -> u64 {
    5
}

/// Bounce processing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BounceConfig {
    /// Master switch for the bounce pipeline
    #[serde(default)]
    pub enabled: bool,

    /// Action applied when a subscriber crosses the bounce threshold
    #[serde(default)]
    pub action: BounceActionConfig,

    /// Mailboxes scanned for bounce mail
    #[serde(default)]
    pub mailbox: Vec<BounceMailboxConfig>,
}

/// Threshold + action pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceActionConfig {
    /// Bounce count after which the action fires
    #[serde(default = "default_bounce_count")]
    pub count: i64,

    /// What to do with the subscriber
    #[serde(default)]
    pub action: BounceAction,
}

impl Default for BounceActionConfig {
    fn default() -> Self {
        Self {
            count: default_bounce_count(),
            action: BounceAction::None,
        }
    }
}

fn default_bounce_count() -> i64 {
    2
}

/// A POP3 mailbox scanned for bounce mail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceMailboxConfig {
    /// POP3 host
    pub host: String,

    /// POP3 port
    #[serde(default = "default_pop3_port")]
    pub port: u16,

    /// Authentication method
    #[serde(default)]
    pub auth_protocol: MailboxAuth,

    /// Mailbox username; also used to exclude the mailbox's own address
    /// during recipient extraction
    #[serde(default)]
    pub username: String,

    /// Mailbox password
    #[serde(default)]
    pub password: String,

    /// Connect with implicit TLS
    #[serde(default)]
    pub tls_enabled: bool,

    /// Skip server certificate verification
    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Seconds between scan cycles
    #[serde(default = "default_bounce_scan_interval")]
    pub scan_interval_secs: u64,

    /// Maximum messages downloaded per cycle
    #[serde(default = "default_bounce_fetch_limit")]
    pub fetch_limit: usize,
}

fn default_pop3_port() -> u16 {
    110
}

fn default_bounce_scan_interval() -> u64 {
    900
}

fn default_bounce_fetch_limit() -> usize {
    100
}

/// Status notification configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Webhook URL receiving campaign status events as JSON
    pub webhook_url: Option<String>,

    /// Shared secret used to sign webhook payloads
    pub webhook_secret: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./listmill.toml"),
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/listmill/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Sanity-check values that would otherwise fail deep inside the engine
    pub fn validate(&self) -> crate::Result<()> {
        if self.campaign.concurrency == 0 {
            return Err(crate::Error::Config(
                "campaign.concurrency must be at least 1".to_string(),
            ));
        }
        if self.campaign.batch_size == 0 {
            return Err(crate::Error::Config(
                "campaign.batch_size must be at least 1".to_string(),
            ));
        }
        for srv in &self.smtp {
            if srv.enabled && srv.host.is_empty() {
                return Err(crate::Error::Config(
                    "smtp server host must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_sections() {
        let campaign = CampaignConfig::default();
        assert_eq!(campaign.concurrency, 10);
        assert_eq!(campaign.batch_size, 1000);
        assert_eq!(campaign.max_send_errors, 0);

        let action = BounceActionConfig::default();
        assert_eq!(action.count, 2);
        assert_eq!(action.action, crate::types::BounceAction::None);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "mail.example.com"
root_url = "https://news.example.com"

[database]
url = "postgres://localhost/listmill"

[campaign]
concurrency = 4
batch_size = 500
max_send_errors = 100
sliding_window = true
sliding_window_rate = 200
sliding_window_duration_secs = 300
from_email = "News <news@example.com>"

[[smtp]]
host = "smtp.example.com"
port = 465
username = "sender@example.com"
password = "abcd efgh ijkl"
auth_protocol = "plain"
tls_type = "tls"
max_conns = 4

[bounce]
enabled = true

[bounce.action]
count = 3
action = "blocklist"

[[bounce.mailbox]]
host = "pop.example.com"
port = 995
auth_protocol = "userpass"
username = "bounce@example.com"
password = "secret"
tls_enabled = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.hostname.as_deref(), Some("mail.example.com"));
        assert_eq!(config.campaign.concurrency, 4);
        assert_eq!(config.smtp.len(), 1);
        assert_eq!(config.smtp[0].port, 465);
        assert_eq!(
            config.smtp[0].tls_type,
            crate::types::TlsType::Tls
        );
        assert!(config.bounce.enabled);
        assert_eq!(config.bounce.mailbox[0].port, 995);
        assert_eq!(
            config.bounce.action.action,
            crate::types::BounceAction::Blocklist
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let toml = r#"
[database]
url = "postgres://localhost/listmill"

[campaign]
concurrency = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
