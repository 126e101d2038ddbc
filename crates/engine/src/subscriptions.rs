//! Push subscription store: browser push registrations keyed by endpoint.
//!
//! The endpoint is the natural key: registering the same endpoint again
//! updates the existing row instead of adding a duplicate. Rows go away on
//! explicit unsubscribe or when a delivery reports the endpoint gone.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use tally_common::error::AppError;
use tally_common::types::PushSubscription;

/// Registration data sent by the browser (`PushSubscription.toJSON()`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisterSubscriptionParams {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

impl RegisterSubscriptionParams {
    pub fn validate(&self) -> Result<(), AppError> {
        if !self.endpoint.starts_with("https://") {
            return Err(AppError::Validation(format!(
                "Push endpoint must be an https URL, got '{}'",
                self.endpoint
            )));
        }
        if self.p256dh.trim().is_empty() || self.auth.trim().is_empty() {
            return Err(AppError::Validation(
                "Push subscription keys p256dh and auth are required".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_endpoint(&self, endpoint: &str) -> Result<Option<PushSubscription>, AppError>;

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<PushSubscription>, AppError>;

    /// Create or rebind the subscription for `params.endpoint`.
    async fn upsert(
        &self,
        user_id: Uuid,
        params: &RegisterSubscriptionParams,
    ) -> Result<PushSubscription, AppError>;

    /// Explicit unsubscribe. Only the owner's row is removed.
    async fn delete_by_endpoint(&self, endpoint: &str, user_id: Uuid) -> Result<bool, AppError>;

    /// Prune subscriptions whose endpoints were reported permanently gone.
    async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<u64, AppError>;
}

/// PostgreSQL-backed subscription store.
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_by_endpoint(&self, endpoint: &str) -> Result<Option<PushSubscription>, AppError> {
        let sub: Option<PushSubscription> =
            sqlx::query_as("SELECT * FROM push_subscriptions WHERE endpoint = $1")
                .bind(endpoint)
                .fetch_optional(&self.pool)
                .await?;

        Ok(sub)
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<PushSubscription>, AppError> {
        let subs: Vec<PushSubscription> = sqlx::query_as(
            "SELECT * FROM push_subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    async fn upsert(
        &self,
        user_id: Uuid,
        params: &RegisterSubscriptionParams,
    ) -> Result<PushSubscription, AppError> {
        params.validate()?;

        let sub: PushSubscription = sqlx::query_as(
            r#"
            INSERT INTO push_subscriptions (id, user_id, endpoint, p256dh, auth, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (endpoint) DO UPDATE
                SET user_id = EXCLUDED.user_id,
                    p256dh = EXCLUDED.p256dh,
                    auth = EXCLUDED.auth
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&params.endpoint)
        .bind(&params.p256dh)
        .bind(&params.auth)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            subscription_id = %sub.id,
            user_id = %user_id,
            "Push subscription registered"
        );

        Ok(sub)
    }

    async fn delete_by_endpoint(&self, endpoint: &str, user_id: Uuid) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = $1 AND user_id = $2")
                .bind(endpoint)
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::info!(user_id = %user_id, "Push subscription removed");
        }

        Ok(deleted)
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM push_subscriptions WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
