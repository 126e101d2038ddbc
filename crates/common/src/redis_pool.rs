use redis::Client;
use redis::aio::ConnectionManager;

use crate::config::RedisConfig;

/// Open a Redis client without connecting.
pub fn create_redis_client(config: &RedisConfig) -> anyhow::Result<Client> {
    Ok(Client::open(config.url())?)
}

/// Create a reconnecting Redis connection manager.
///
/// The queue issues blocking reads; the cache opens its own manager.
pub async fn create_redis_pool(config: &RedisConfig) -> anyhow::Result<ConnectionManager> {
    let client = create_redis_client(config)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!(host = %config.host, port = config.port, "Connected to Redis");
    Ok(manager)
}
