//! The storage contract the campaign engine runs against.
//!
//! The engine only ever talks to the [`Store`] trait so tests can drive it
//! with an in-memory implementation; [`PgStore`] is the Postgres-backed
//! production implementation composed from the repositories.

use crate::db::DatabasePool;
use crate::models::{Bounce, Campaign, Subscriber};
use crate::repository::{BounceRepository, CampaignRepository, SubscriberRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listmill_common::config::BounceActionConfig;
use listmill_common::types::{CampaignId, CampaignStatus, SubscriberId};
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage operations required by the campaign engine and bounce pipeline.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Campaigns whose status is running or scheduled, ascending by id.
    /// The scan loop derives both pipe creation and stop propagation from
    /// this set.
    async fn running_campaigns(&self) -> StoreResult<Vec<Campaign>>;

    /// Fetch a single campaign.
    async fn get_campaign(&self, id: CampaignId) -> StoreResult<Option<Campaign>>;

    /// Fetch up to `limit` eligible, not-yet-processed subscribers for the
    /// campaign, ascending by id. Advances the campaign's cursor in the
    /// same statement, so a batch is never handed out twice.
    async fn next_subscribers(
        &self,
        campaign_id: CampaignId,
        limit: i64,
    ) -> StoreResult<Vec<Subscriber>>;

    /// Transition a campaign's status.
    async fn update_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
    ) -> StoreResult<()>;

    /// Apply counter deltas and advance the sent-progress cursor.
    async fn update_campaign_counts(
        &self,
        id: CampaignId,
        to_send_delta: i64,
        sent_delta: i64,
        last_subscriber_id: SubscriberId,
    ) -> StoreResult<()>;

    /// Successful sends recorded for the campaign in the UTC hour of `at`.
    async fn campaign_hourly_sent(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// Upsert one successful send into the campaign's hourly quota row.
    async fn increment_hourly_sent(&self, id: CampaignId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Record a bounce, resolving the subscriber by uuid with an email
    /// fallback, and apply the configured bounce action once the
    /// subscriber's bounce count reaches the threshold.
    async fn record_bounce(&self, bounce: Bounce) -> StoreResult<()>;
}

/// Postgres-backed [`Store`]
#[derive(Clone)]
pub struct PgStore {
    campaigns: CampaignRepository,
    subscribers: SubscriberRepository,
    bounces: BounceRepository,
    bounce_action: BounceActionConfig,
}

impl PgStore {
    /// Create a store over the shared pool
    pub fn new(db: DatabasePool, bounce_action: BounceActionConfig) -> Self {
        let pool = db.pool().clone();
        Self {
            campaigns: CampaignRepository::new(pool.clone()),
            subscribers: SubscriberRepository::new(pool.clone()),
            bounces: BounceRepository::new(pool),
            bounce_action,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn running_campaigns(&self) -> StoreResult<Vec<Campaign>> {
        Ok(self.campaigns.running().await?)
    }

    async fn get_campaign(&self, id: CampaignId) -> StoreResult<Option<Campaign>> {
        Ok(self.campaigns.get(id).await?)
    }

    async fn next_subscribers(
        &self,
        campaign_id: CampaignId,
        limit: i64,
    ) -> StoreResult<Vec<Subscriber>> {
        Ok(self.campaigns.next_subscribers(campaign_id, limit).await?)
    }

    async fn update_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
    ) -> StoreResult<()> {
        Ok(self.campaigns.update_status(id, status).await?)
    }

    async fn update_campaign_counts(
        &self,
        id: CampaignId,
        to_send_delta: i64,
        sent_delta: i64,
        last_subscriber_id: SubscriberId,
    ) -> StoreResult<()> {
        Ok(self
            .campaigns
            .update_counts(id, to_send_delta, sent_delta, last_subscriber_id)
            .await?)
    }

    async fn campaign_hourly_sent(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        Ok(self.campaigns.hourly_sent(id, at).await?)
    }

    async fn increment_hourly_sent(&self, id: CampaignId, at: DateTime<Utc>) -> StoreResult<()> {
        Ok(self.campaigns.increment_hourly_sent(id, at).await?)
    }

    async fn record_bounce(&self, bounce: Bounce) -> StoreResult<()> {
        self.bounces
            .record(&bounce, &self.bounce_action, &self.subscribers)
            .await
    }
}
