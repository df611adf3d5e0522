//! Bounce repository

use crate::models::Bounce;
use crate::repository::SubscriberRepository;
use crate::store::StoreResult;
use listmill_common::config::BounceActionConfig;
use listmill_common::types::{BounceAction, SubscriberId};
use sqlx::PgPool;
use tracing::{debug, info, warn};

/// Bounce repository
#[derive(Clone)]
pub struct BounceRepository {
    pool: PgPool,
}

impl BounceRepository {
    /// Create a new bounce repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a bounce against its subscriber and campaign, then apply the
    /// configured action once the subscriber's bounce count reaches the
    /// threshold. The subscriber is resolved by uuid first, falling back to
    /// the extracted email address.
    pub async fn record(
        &self,
        bounce: &Bounce,
        action: &BounceActionConfig,
        subscribers: &SubscriberRepository,
    ) -> StoreResult<()> {
        let subscriber_id = self.resolve_subscriber(bounce, subscribers).await?;

        let Some(subscriber_id) = subscriber_id else {
            warn!(
                email = %bounce.email,
                "Bounce does not match any subscriber, dropping"
            );
            return Ok(());
        };

        let campaign_id: Option<i64> = match bounce.campaign_uuid {
            Some(uuid) => {
                let row: Option<(i64,)> =
                    sqlx::query_as("SELECT id FROM campaigns WHERE uuid = $1")
                        .bind(uuid)
                        .fetch_optional(&self.pool)
                        .await?;
                row.map(|(id,)| id)
            }
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO bounces (subscriber_id, campaign_id, type, source, meta, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(subscriber_id)
        .bind(campaign_id)
        .bind(bounce.kind.to_string())
        .bind(&bounce.source)
        .bind(&bounce.meta)
        .bind(bounce.created_at)
        .execute(&self.pool)
        .await?;

        debug!(
            subscriber_id,
            campaign_id = ?campaign_id,
            kind = %bounce.kind,
            "Recorded bounce"
        );

        self.apply_action(subscriber_id, action, subscribers).await
    }

    /// Count bounces recorded against a subscriber
    pub async fn count_for_subscriber(&self, id: SubscriberId) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM bounces WHERE subscriber_id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn resolve_subscriber(
        &self,
        bounce: &Bounce,
        subscribers: &SubscriberRepository,
    ) -> StoreResult<Option<SubscriberId>> {
        if let Some(uuid) = bounce.subscriber_uuid {
            if let Some(id) = subscribers.id_by_uuid(uuid).await? {
                return Ok(Some(id));
            }
        }
        if bounce.email.is_empty() {
            return Ok(None);
        }
        Ok(subscribers.id_by_email(&bounce.email).await?)
    }

    /// Applying the action twice is harmless: blocklisting is idempotent and
    /// deletion removes the bounce rows with the subscriber.
    async fn apply_action(
        &self,
        subscriber_id: SubscriberId,
        action: &BounceActionConfig,
        subscribers: &SubscriberRepository,
    ) -> StoreResult<()> {
        if action.action == BounceAction::None || action.count <= 0 {
            return Ok(());
        }

        let count = self.count_for_subscriber(subscriber_id).await?;
        if count < action.count {
            return Ok(());
        }

        match action.action {
            BounceAction::Blocklist => {
                subscribers.blocklist(subscriber_id).await?;
                info!(subscriber_id, count, "Blocklisted subscriber after bounces");
            }
            BounceAction::Delete => {
                subscribers.delete(subscriber_id).await?;
                info!(subscriber_id, count, "Deleted subscriber after bounces");
            }
            BounceAction::None => {}
        }

        Ok(())
    }
}
