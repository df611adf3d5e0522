//! Database models

use chrono::{DateTime, Utc};
use listmill_common::types::{
    BounceType, CampaignId, CampaignStatus, ContentType, SubscriberId, SubscriberStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub uuid: Uuid,
    pub name: String,
    pub subject: String,
    pub from_email: Option<String>,
    pub body: String,
    pub content_type: String,
    pub messenger: String,
    pub status: String,
    /// Per-day send cap; NULL or 0 means unlimited
    pub daily_quota: Option<i64>,
    /// Optional "HH:MM-HH:MM" UTC send window
    pub send_interval: Option<String>,
    pub to_send: i64,
    pub sent: i64,
    pub last_subscriber_id: SubscriberId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Parsed lifecycle status; unknown strings are treated as draft
    pub fn status(&self) -> CampaignStatus {
        CampaignStatus::from_str(&self.status).unwrap_or(CampaignStatus::Draft)
    }

    /// Parsed content type; unknown strings are treated as richtext
    pub fn content_type(&self) -> ContentType {
        ContentType::from_str(&self.content_type).unwrap_or(ContentType::Richtext)
    }

    /// Effective per-day quota, if one is configured and positive
    pub fn quota(&self) -> Option<i64> {
        self.daily_quota.filter(|q| *q > 0)
    }
}

/// Subscriber model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub uuid: Uuid,
    pub email: String,
    pub name: String,
    /// Opaque key/value attributes used in template personalization
    pub attribs: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn status(&self) -> SubscriberStatus {
        SubscriberStatus::from_str(&self.status).unwrap_or(SubscriberStatus::Disabled)
    }
}

/// A bounce event extracted from a bounce mailbox, ready for recording.
///
/// The uuid fields are `None` when the source mail carried no valid v4
/// value; recording then falls back to an email lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounce {
    pub email: String,
    pub campaign_uuid: Option<Uuid>,
    pub subscriber_uuid: Option<Uuid>,
    pub kind: BounceType,
    /// Where the bounce came from, e.g. the mailbox username
    pub source: String,
    /// Classification reason plus ancillary mail headers
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn campaign(status: &str, quota: Option<i64>) -> Campaign {
        Campaign {
            id: 1,
            uuid: Uuid::new_v4(),
            name: "welcome".to_string(),
            subject: "Hello".to_string(),
            from_email: None,
            body: "hi {{name}}".to_string(),
            content_type: "richtext".to_string(),
            messenger: "email".to_string(),
            status: status.to_string(),
            daily_quota: quota,
            send_interval: None,
            to_send: 0,
            sent: 0,
            last_subscriber_id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_campaign_status_accessor() {
        assert_eq!(campaign("running", None).status(), CampaignStatus::Running);
        assert_eq!(campaign("bogus", None).status(), CampaignStatus::Draft);
    }

    #[test]
    fn test_quota_filters_zero() {
        assert_eq!(campaign("running", Some(0)).quota(), None);
        assert_eq!(campaign("running", Some(24)).quota(), Some(24));
        assert_eq!(campaign("running", None).quota(), None);
    }
}
