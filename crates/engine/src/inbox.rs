//! Inbox read API: what an HTTP layer would call on behalf of a user.

use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use tally_common::context::RequestContext;
use tally_common::error::AppError;
use tally_common::types::PushSubscription;

use crate::cache::{CacheClient, UNREAD_FLAG_TTL, invalidate_unread, unread_key};
use crate::notifications::{NotificationPage, NotificationStore};
use crate::subscriptions::{RegisterSubscriptionParams, SubscriptionStore};

pub struct InboxService {
    notifications: Arc<dyn NotificationStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    cache: Arc<dyn CacheClient>,
    vapid_public_key: String,
}

impl InboxService {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        cache: Arc<dyn CacheClient>,
        vapid_public_key: impl Into<String>,
    ) -> Self {
        Self {
            notifications,
            subscriptions,
            cache,
            vapid_public_key: vapid_public_key.into(),
        }
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<NotificationPage, AppError> {
        self.notifications
            .find_by_user_with_cursor(ctx.user_id, cursor, limit)
            .instrument(ctx.span())
            .await
    }

    /// Unread flag, served from cache when present.
    pub async fn has_unread(&self, ctx: &RequestContext) -> Result<bool, AppError> {
        async {
            let key = unread_key(ctx.user_id);
            match self.cache.get(&key).await {
                Ok(Some(cached)) => return Ok(cached == "1"),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Unread flag cache read failed"),
            }

            let unread = self.notifications.has_unread(ctx.user_id).await?;
            let value = if unread { "1" } else { "0" };
            if let Err(e) = self.cache.set(&key, value, UNREAD_FLAG_TTL).await {
                tracing::warn!(error = %e, "Unread flag cache write failed");
                return Ok(unread);
            }

            // A write or read-marking that invalidated the key between the query
            // and the SET above would otherwise stay hidden for a full TTL.
            let current = self.notifications.has_unread(ctx.user_id).await?;
            if current != unread {
                tracing::debug!("Unread flag changed while caching, dropping it");
                if let Err(e) = self.cache.delete(&key).await {
                    tracing::warn!(error = %e, "Unread flag cache delete failed");
                }
            }
            Ok::<_, AppError>(current)
        }
        .instrument(ctx.span())
        .await
    }

    /// Returns `false` when the id does not exist or belongs to someone else.
    pub async fn mark_as_read(&self, ctx: &RequestContext, id: Uuid) -> Result<bool, AppError> {
        async {
            let updated = self.notifications.mark_as_read(id, ctx.user_id).await?;
            if updated {
                invalidate_unread(self.cache.as_ref(), &[ctx.user_id]).await;
            } else {
                tracing::debug!(notification_id = %id, "Mark-as-read matched no owned row");
            }
            Ok::<_, AppError>(updated)
        }
        .instrument(ctx.span())
        .await
    }

    pub async fn mark_all_as_read(&self, ctx: &RequestContext) -> Result<u64, AppError> {
        async {
            let affected = self.notifications.mark_all_as_read(ctx.user_id).await?;
            invalidate_unread(self.cache.as_ref(), &[ctx.user_id]).await;
            Ok::<_, AppError>(affected)
        }
        .instrument(ctx.span())
        .await
    }

    pub async fn subscribe(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> Result<PushSubscription, AppError> {
        let params = RegisterSubscriptionParams {
            endpoint: endpoint.to_string(),
            p256dh: p256dh.to_string(),
            auth: auth.to_string(),
        };
        async {
            let sub = self.subscriptions.upsert(ctx.user_id, &params).await?;
            tracing::info!(subscription_id = %sub.id, "Push subscription registered");
            Ok::<_, AppError>(sub)
        }
        .instrument(ctx.span())
        .await
    }

    pub async fn unsubscribe(&self, ctx: &RequestContext, endpoint: &str) -> Result<bool, AppError> {
        self.subscriptions
            .delete_by_endpoint(endpoint, ctx.user_id)
            .instrument(ctx.span())
            .await
    }

    pub fn vapid_public_key(&self) -> &str {
        &self.vapid_public_key
    }
}
