use thiserror::Error;

/// Common error types used across the notification pipeline.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether redelivering the job that hit this error may succeed.
    ///
    /// Infrastructure failures are transient; malformed input never is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Redis(_) | AppError::Queue(_)
        )
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::MalformedEvent(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AppError::Queue("connection reset".to_string()).is_transient());
        assert!(AppError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!AppError::MalformedEvent("missing type".to_string()).is_transient());
        assert!(!AppError::Validation("bad cursor".to_string()).is_transient());
    }
}
