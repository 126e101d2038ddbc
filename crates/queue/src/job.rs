use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_common::config::{COMPLETED_JOB_RETENTION_SECS, FAILED_JOB_RETENTION_SECS};
use tally_common::context::JobContext;

use crate::error::QueueError;

/// How long finished job records are kept before the queue trims them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRetention {
    pub remove_on_complete: Duration,
    pub remove_on_fail: Duration,
}

impl Default for JobRetention {
    /// One day for completed jobs, two days for failed ones.
    fn default() -> Self {
        Self {
            remove_on_complete: Duration::from_secs(COMPLETED_JOB_RETENTION_SECS),
            remove_on_fail: Duration::from_secs(FAILED_JOB_RETENTION_SECS),
        }
    }
}

/// A job handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: String,
    pub name: String,
    /// Raw payload text. Decoding is the handler's business so that a
    /// malformed payload can be dead-lettered instead of silently dropped.
    pub payload: String,
    /// 1 on first delivery.
    pub attempt: u32,
    pub retention: JobRetention,
}

impl QueuedJob {
    pub fn context(&self) -> JobContext {
        JobContext {
            job_id: self.id.clone(),
            job_name: self.name.clone(),
            attempt: self.attempt,
        }
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Completed,
    Failed,
}

/// Record kept for a finished job until its retention expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub state: JobState,
    pub attempt: u32,
    pub reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn completed(job: &QueuedJob) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            state: JobState::Completed,
            attempt: job.attempt,
            reason: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(job: &QueuedJob, reason: &str) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            state: JobState::Failed,
            attempt: job.attempt,
            reason: Some(reason.to_string()),
            finished_at: Utc::now(),
        }
    }
}

/// What the consumer should do with a job after handling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Done; remove from the queue.
    Ack,
    /// Leave unacknowledged so the queue redelivers it.
    Retry(String),
    /// Never redeliver.
    Dead(String),
}

/// Durable queue contract shared by producers and consumers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job. Returns the backend job id.
    async fn enqueue(
        &self,
        name: &str,
        payload: &str,
        retention: JobRetention,
    ) -> Result<String, QueueError>;

    /// Take up to `max` jobs: redeliverable ones first, then new ones.
    async fn fetch(&self, max: usize) -> Result<Vec<QueuedJob>, QueueError>;

    async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Release a job for redelivery.
    async fn nack(&self, job: &QueuedJob, reason: &str) -> Result<(), QueueError>;

    async fn dead_letter(&self, job: &QueuedJob, reason: &str) -> Result<(), QueueError>;
}

/// Processes jobs taken from a [`JobQueue`].
///
/// Handlers run under at-least-once delivery and must tolerate seeing the
/// same job more than once.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &QueuedJob, ctx: &JobContext) -> JobOutcome;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retention() {
        let retention = JobRetention::default();
        assert_eq!(retention.remove_on_complete, Duration::from_secs(86_400));
        assert_eq!(retention.remove_on_fail, Duration::from_secs(172_800));
    }

    #[test]
    fn test_job_context_from_job() {
        let job = QueuedJob {
            id: "1-0".to_string(),
            name: "log.created".to_string(),
            payload: "{}".to_string(),
            attempt: 2,
            retention: JobRetention::default(),
        };
        let ctx = job.context();
        assert_eq!(ctx.job_id, "1-0");
        assert_eq!(ctx.job_name, "log.created");
        assert_eq!(ctx.attempt, 2);
    }
}
