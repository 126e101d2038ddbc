//! Thin cache client.
//!
//! Exposes exactly the operations the notifier needs: connect, disconnect,
//! get, set with TTL, single and multi-key delete. The cache is an optimization only; callers
//! treat every cache error as a miss.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use uuid::Uuid;

use tally_common::error::AppError;

/// TTL of the cached "has unread notifications" flag.
pub const UNREAD_FLAG_TTL: Duration = Duration::from_secs(60);

/// Cache key of a user's unread flag.
pub fn unread_key(user_id: Uuid) -> String {
    format!("notifications:unread:{}", user_id)
}

#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn connect(&self) -> Result<(), AppError>;

    async fn disconnect(&self) -> Result<(), AppError>;

    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError>;

    async fn delete(&self, key: &str) -> Result<(), AppError>;

    /// Delete every key in one round trip.
    async fn delete_many(&self, keys: &[String]) -> Result<(), AppError>;
}

/// Drop the cached unread flag of every user in `user_ids`.
///
/// Failures are logged; a stale flag expires on its own within
/// [`UNREAD_FLAG_TTL`].
pub async fn invalidate_unread(cache: &dyn CacheClient, user_ids: &[Uuid]) {
    if user_ids.is_empty() {
        return;
    }
    let keys: Vec<String> = user_ids.iter().map(|id| unread_key(*id)).collect();
    if let Err(e) = cache.delete_many(&keys).await {
        tracing::warn!(users = user_ids.len(), error = %e, "Failed to invalidate unread flags");
    }
}

/// Redis-backed cache.
pub struct RedisCache {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisCache {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: RwLock::new(None),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, AppError> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::Internal("cache is not connected".to_string()))
    }
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn connect(&self) -> Result<(), AppError> {
        let mut guard = self.conn.write().await;
        if guard.is_none() {
            let manager = ConnectionManager::new(self.client.clone()).await?;
            *guard = Some(manager);
            tracing::info!("Cache connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AppError> {
        if self.conn.write().await.take().is_some() {
            tracing::info!("Cache disconnected");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.connection().await?;

        // SET key value EX ttl
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), AppError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}
