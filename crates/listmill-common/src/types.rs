//! Common types for listmill

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric identifier for campaigns
pub type CampaignId = i64;

/// Numeric identifier for subscribers
pub type SubscriberId = i64;

/// Numeric identifier for lists
pub type ListId = i64;

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Cancelled,
    Finished,
}

impl CampaignStatus {
    /// True for statuses that should have a live pipe.
    pub fn is_active(&self) -> bool {
        matches!(self, CampaignStatus::Running | CampaignStatus::Scheduled)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Cancelled => "cancelled",
            CampaignStatus::Finished => "finished",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "running" => Ok(CampaignStatus::Running),
            "paused" => Ok(CampaignStatus::Paused),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            "finished" => Ok(CampaignStatus::Finished),
            other => Err(crate::Error::Validation(format!(
                "Unknown campaign status: {}",
                other
            ))),
        }
    }
}

/// Subscriber status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Enabled,
    Disabled,
    Blocklisted,
}

impl std::fmt::Display for SubscriberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriberStatus::Enabled => "enabled",
            SubscriberStatus::Disabled => "disabled",
            SubscriberStatus::Blocklisted => "blocklisted",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SubscriberStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(SubscriberStatus::Enabled),
            "disabled" => Ok(SubscriberStatus::Disabled),
            "blocklisted" => Ok(SubscriberStatus::Blocklisted),
            other => Err(crate::Error::Validation(format!(
                "Unknown subscriber status: {}",
                other
            ))),
        }
    }
}

/// Campaign body content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Richtext,
    Html,
    Markdown,
    Plain,
    Visual,
}

impl ContentType {
    /// Whether the rendered body ships as text/html.
    pub fn is_html(&self) -> bool {
        !matches!(self, ContentType::Plain)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentType::Richtext => "richtext",
            ContentType::Html => "html",
            ContentType::Markdown => "markdown",
            ContentType::Plain => "plain",
            ContentType::Visual => "visual",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ContentType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "richtext" => Ok(ContentType::Richtext),
            "html" => Ok(ContentType::Html),
            "markdown" => Ok(ContentType::Markdown),
            "plain" => Ok(ContentType::Plain),
            "visual" => Ok(ContentType::Visual),
            other => Err(crate::Error::Validation(format!(
                "Unknown content type: {}",
                other
            ))),
        }
    }
}

/// Bounce severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceType {
    Hard,
    Soft,
    Complaint,
}

impl std::fmt::Display for BounceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BounceType::Hard => "hard",
            BounceType::Soft => "soft",
            BounceType::Complaint => "complaint",
        };
        write!(f, "{}", s)
    }
}

/// Action applied to a subscriber once their bounce count crosses the
/// configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BounceAction {
    #[default]
    None,
    Blocklist,
    Delete,
}

/// SMTP client authentication protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthProtocol {
    Plain,
    Login,
    Cram,
    #[default]
    None,
}

/// Outbound connection TLS mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsType {
    #[default]
    None,
    /// Implicit TLS on connect (port 465 style)
    Tls,
    /// Opportunistic upgrade on a plaintext connection (port 587 style)
    Starttls,
}

/// POP3 mailbox authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MailboxAuth {
    #[default]
    Userpass,
    Apop,
    None,
}

/// A minimal email address, split for envelope use
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.splitn(2, '@').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            Some(Self {
                local: parts[0].to_string(),
                domain: parts[1].to_string(),
            })
        } else {
            None
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// Validate a version-4 UUID string. Returns the parsed value only when the
/// input is well-formed v4; anything else maps to `None` so callers can fall
/// back to email-based lookups.
pub fn valid_v4_uuid(s: &str) -> Option<Uuid> {
    let u = Uuid::parse_str(s.trim()).ok()?;
    if u.get_version_num() == 4 {
        Some(u)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_campaign_status_roundtrip() {
        for s in ["draft", "scheduled", "running", "paused", "cancelled", "finished"] {
            let status = CampaignStatus::from_str(s).unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!(CampaignStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_active_statuses() {
        assert!(CampaignStatus::Running.is_active());
        assert!(CampaignStatus::Scheduled.is_active());
        assert!(!CampaignStatus::Paused.is_active());
        assert!(!CampaignStatus::Finished.is_active());
    }

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
    }

    #[test]
    fn test_valid_v4_uuid() {
        assert!(valid_v4_uuid("550e8400-e29b-41d4-a716-446655440000").is_some());
        // v1 timestamp UUID is rejected
        assert!(valid_v4_uuid("550e8400-e29b-11d4-a716-446655440000").is_none());
        assert!(valid_v4_uuid("not-a-uuid").is_none());
        assert!(valid_v4_uuid("").is_none());
    }

    #[test]
    fn test_content_type_html() {
        assert!(ContentType::Richtext.is_html());
        assert!(ContentType::Visual.is_html());
        assert!(!ContentType::Plain.is_html());
    }
}
