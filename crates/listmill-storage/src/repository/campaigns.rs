//! Campaign repository

use crate::models::{Campaign, Subscriber};
use chrono::{DateTime, Timelike, Utc};
use listmill_common::types::{CampaignId, CampaignStatus, SubscriberId};
use sqlx::PgPool;

/// Campaign repository
#[derive(Clone)]
pub struct CampaignRepository {
    pool: PgPool,
}

impl CampaignRepository {
    /// Create a new campaign repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a campaign by ID
    pub async fn get(&self, id: CampaignId) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Campaigns in running or scheduled status, ascending by id
    pub async fn running(&self) -> Result<Vec<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status IN ('running', 'scheduled')
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Fetch the next batch of eligible subscribers for a campaign and
    /// advance the campaign's cursor in the same statement. Eligible means:
    /// enabled, on one of the campaign's lists with a live subscription,
    /// and past the cursor. Ascending id order.
    pub async fn next_subscribers(
        &self,
        campaign_id: CampaignId,
        limit: i64,
    ) -> Result<Vec<Subscriber>, sqlx::Error> {
        sqlx::query_as::<_, Subscriber>(
            r#"
            WITH batch AS (
                SELECT s.*
                FROM subscribers s
                WHERE s.status = 'enabled'
                  AND s.id > (SELECT last_subscriber_id FROM campaigns WHERE id = $1)
                  AND EXISTS (
                      SELECT 1 FROM subscriber_lists sl
                      JOIN campaign_lists cl ON cl.list_id = sl.list_id
                      WHERE cl.campaign_id = $1
                        AND sl.subscriber_id = s.id
                        AND sl.status != 'unsubscribed'
                  )
                ORDER BY s.id ASC
                LIMIT $2
            ),
            cur AS (
                UPDATE campaigns
                SET last_subscriber_id = COALESCE((SELECT MAX(id) FROM batch), last_subscriber_id),
                    updated_at = NOW()
                WHERE id = $1
            )
            SELECT * FROM batch
            "#,
        )
        .bind(campaign_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Update campaign status
    pub async fn update_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                status = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply counter deltas. `last_subscriber_id` only ever moves forward;
    /// the fetch cursor may already be ahead of the sent progress.
    pub async fn update_counts(
        &self,
        id: CampaignId,
        to_send_delta: i64,
        sent_delta: i64,
        last_subscriber_id: SubscriberId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                to_send = GREATEST(to_send + $2, 0),
                sent = sent + $3,
                last_subscriber_id = GREATEST(last_subscriber_id, $4),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(to_send_delta)
        .bind(sent_delta)
        .bind(last_subscriber_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Successful sends recorded in the UTC hour of `at`
    pub async fn hourly_sent(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let (date, hour) = quota_key(at);

        let count: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT sent_count FROM campaign_send_quota
            WHERE campaign_id = $1 AND date = $2 AND hour = $3
            "#,
        )
        .bind(id)
        .bind(date)
        .bind(hour)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.map(|(c,)| c).unwrap_or(0))
    }

    /// Upsert one successful send into the hourly quota row
    pub async fn increment_hourly_sent(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let (date, hour) = quota_key(at);

        sqlx::query(
            r#"
            INSERT INTO campaign_send_quota (campaign_id, date, hour, sent_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (campaign_id, date, hour)
            DO UPDATE SET sent_count = campaign_send_quota.sent_count + 1
            "#,
        )
        .bind(id)
        .bind(date)
        .bind(hour)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// (date, hour) key of the UTC hour containing `at`
fn quota_key(at: DateTime<Utc>) -> (chrono::NaiveDate, i32) {
    (at.date_naive(), at.hour() as i32)
}
