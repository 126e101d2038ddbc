use thiserror::Error;

/// Queue backend errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

impl QueueError {
    /// Connection-level failure worth backing off for.
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::Redis(e) => e.is_connection_dropped() || e.is_io_error() || e.is_timeout(),
            _ => false,
        }
    }

    /// The consumer group vanished (stream deleted or flushed).
    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, QueueError::Redis(e) if e.code() == Some("NOGROUP"))
    }
}

impl From<QueueError> for tally_common::error::AppError {
    fn from(e: QueueError) -> Self {
        tally_common::error::AppError::Queue(e.to_string())
    }
}
