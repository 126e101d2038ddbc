use serde::Deserialize;

/// Completed jobs expire from the queue after one day.
pub const COMPLETED_JOB_RETENTION_SECS: u64 = 86_400;

/// Failed jobs are kept for two days for inspection.
pub const FAILED_JOB_RETENTION_SECS: u64 = 172_800;

/// Notifications older than this are purged regardless of read state.
pub const NOTIFICATION_RETENTION_DAYS: i64 = 30;

/// Interval between retention purges.
pub const CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Redis connection settings for the job queue and cache.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl RedisConfig {
    /// Render as a `redis://` connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}", password, self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

/// VAPID sender identification for browser push.
#[derive(Debug, Clone, Deserialize)]
pub struct VapidConfig {
    /// Base64url public key handed to browsers at registration time
    pub public_key: String,

    /// Path to the PEM-encoded EC private key
    pub private_key_path: String,

    /// Contact address used in the `sub` claim
    pub contact: String,
}

/// Global application configuration loaded from environment variables.
///
/// Fixed for the lifetime of the process.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Queue / cache connection
    pub redis: RedisConfig,

    /// Push signing key pair and contact
    pub vapid: VapidConfig,

    /// Number of jobs processed concurrently by one worker (default: 8)
    pub worker_concurrency: usize,

    /// Idle time after which an unacknowledged job is redelivered (default: 60s)
    pub queue_visibility_timeout_ms: u64,

    /// Deliveries after which a job is dead-lettered (default: 5)
    pub queue_max_deliveries: u32,

    /// Skip the member who triggered the event (default: true)
    pub notify_exclude_actor: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            redis: RedisConfig {
                host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: std::env::var("REDIS_PORT")
                    .unwrap_or_else(|_| "6379".to_string())
                    .parse()
                    .map_err(|_| anyhow::anyhow!("REDIS_PORT must be a valid u16"))?,
                password: std::env::var("REDIS_PASSWORD")
                    .ok()
                    .filter(|p| !p.is_empty()),
            },
            vapid: VapidConfig {
                public_key: std::env::var("VAPID_PUBLIC_KEY").map_err(|_| {
                    anyhow::anyhow!("VAPID_PUBLIC_KEY environment variable is required")
                })?,
                private_key_path: std::env::var("VAPID_PRIVATE_KEY_PATH").map_err(|_| {
                    anyhow::anyhow!("VAPID_PRIVATE_KEY_PATH environment variable is required")
                })?,
                contact: std::env::var("VAPID_CONTACT").map_err(|_| {
                    anyhow::anyhow!("VAPID_CONTACT environment variable is required")
                })?,
            },
            worker_concurrency: std::env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_CONCURRENCY must be a valid usize"))?,
            queue_visibility_timeout_ms: std::env::var("QUEUE_VISIBILITY_TIMEOUT_MS")
                .unwrap_or_else(|_| "60000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("QUEUE_VISIBILITY_TIMEOUT_MS must be a valid u64"))?,
            queue_max_deliveries: std::env::var("QUEUE_MAX_DELIVERIES")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("QUEUE_MAX_DELIVERIES must be a valid u32"))?,
            notify_exclude_actor: std::env::var("NOTIFY_EXCLUDE_ACTOR")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("NOTIFY_EXCLUDE_ACTOR must be true or false"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_without_password() {
        let cfg = RedisConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            password: None,
        };
        assert_eq!(cfg.url(), "redis://cache.internal:6380");
    }

    #[test]
    fn test_redis_url_with_password() {
        let cfg = RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: Some("s3cret".to_string()),
        };
        assert_eq!(cfg.url(), "redis://:s3cret@localhost:6379");
    }
}
