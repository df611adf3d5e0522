//! Subscriber repository

use crate::models::Subscriber;
use listmill_common::types::SubscriberId;
use sqlx::PgPool;
use uuid::Uuid;

/// Subscriber repository
#[derive(Clone)]
pub struct SubscriberRepository {
    pool: PgPool,
}

impl SubscriberRepository {
    /// Create a new subscriber repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a subscriber by ID
    pub async fn get(&self, id: SubscriberId) -> Result<Option<Subscriber>, sqlx::Error> {
        sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Resolve a subscriber id by uuid
    pub async fn id_by_uuid(&self, uuid: Uuid) -> Result<Option<SubscriberId>, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM subscribers WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Resolve a subscriber id by email (case-insensitive)
    pub async fn id_by_email(&self, email: &str) -> Result<Option<SubscriberId>, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM subscribers WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Blocklist a subscriber and retire their list subscriptions
    pub async fn blocklist(&self, id: SubscriberId) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE subscribers SET status = 'blocklisted', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE subscriber_lists SET status = 'unsubscribed', updated_at = NOW() WHERE subscriber_id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    /// Delete a subscriber outright; bounce rows cascade
    pub async fn delete(&self, id: SubscriberId) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM subscribers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
