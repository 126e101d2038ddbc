//! Durable job queue used between event producers and notification workers.
//!
//! Producers and workers share only the [`JobQueue`] contract: a named job
//! with a JSON payload and a retention policy. Delivery is at-least-once; a
//! job that is neither acknowledged nor dead-lettered becomes visible again
//! after the backend's visibility timeout.
//!
//! Two backends are provided:
//! - [`RedisStreamQueue`]: Redis Streams with a consumer group
//! - [`MemoryQueue`]: in-process, for tests and local runs

mod consumer;
mod error;
mod job;
mod memory;
mod redis_stream;

pub use consumer::{ConsumerConfig, QueueConsumer};
pub use error::QueueError;
pub use job::{JobHandler, JobOutcome, JobQueue, JobRecord, JobRetention, JobState, QueuedJob};
pub use memory::MemoryQueue;
pub use redis_stream::{RedisStreamQueue, StreamQueueConfig};
