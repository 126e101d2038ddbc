//! Redis Streams backend.
//!
//! Layout:
//! - `<stream>`: jobs, appended with `XADD MAXLEN ~`, consumed through a
//!   consumer group
//! - `<stream>:completed:<id>`: completion record, expires after
//!   `retention.remove_on_complete`
//! - `<stream>:failed:<id>`: dead-letter record, expires after
//!   `retention.remove_on_fail`
//!
//! A delivered entry stays in the group's pending list until it is acked or
//! dead-lettered. Entries idle longer than the visibility timeout are claimed
//! again by whichever consumer fetches next; that is the only retry path.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisResult};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::job::{JobQueue, JobRecord, JobRetention, QueuedJob};

/// Redis stream queue configuration.
#[derive(Debug, Clone)]
pub struct StreamQueueConfig {
    pub stream_name: String,
    pub consumer_group: String,
    /// Unique per worker process.
    pub consumer_id: String,
    /// Approximate cap on the stream length (`MAXLEN ~`).
    pub max_length: usize,
    /// How long `XREADGROUP` blocks waiting for new entries.
    pub block_ms: usize,
    /// Idle time after which an unacknowledged entry is redelivered.
    pub visibility_timeout_ms: u64,
}

impl Default for StreamQueueConfig {
    fn default() -> Self {
        Self {
            stream_name: "tally:notifications:jobs".to_string(),
            consumer_group: "notification_workers".to_string(),
            consumer_id: format!("worker-{}", uuid::Uuid::new_v4()),
            max_length: 100_000,
            block_ms: 2_000,
            visibility_timeout_ms: 60_000,
        }
    }
}

impl StreamQueueConfig {
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_ms = timeout.as_millis() as u64;
        self
    }

    fn completed_key(&self, id: &str) -> String {
        format!("{}:completed:{}", self.stream_name, id)
    }

    fn failed_key(&self, id: &str) -> String {
        format!("{}:failed:{}", self.stream_name, id)
    }
}

/// Durable queue on top of a Redis stream and consumer group.
#[derive(Clone)]
pub struct RedisStreamQueue {
    redis: ConnectionManager,
    config: StreamQueueConfig,
}

impl RedisStreamQueue {
    pub fn new(redis: ConnectionManager, config: StreamQueueConfig) -> Self {
        Self { redis, config }
    }

    pub fn config(&self) -> &StreamQueueConfig {
        &self.config
    }

    /// Create the consumer group (and stream) if missing.
    pub async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.stream_name, &self.config.consumer_group, "0")
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(group = %self.config.consumer_group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    /// Claim entries whose previous consumer went quiet past the visibility timeout.
    async fn claim_expired(&self, max: usize) -> Result<Vec<QueuedJob>, QueueError> {
        let mut conn = self.redis.clone();

        let pending: StreamPendingCountReply = conn
            .xpending_count(
                &self.config.stream_name,
                &self.config.consumer_group,
                "-",
                "+",
                max,
            )
            .await?;

        let expired: Vec<(String, usize)> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms as u64 >= self.config.visibility_timeout_ms)
            .map(|p| (p.id.clone(), p.times_delivered))
            .collect();

        if expired.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<&str> = expired.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.stream_name,
                &self.config.consumer_group,
                &self.config.consumer_id,
                self.config.visibility_timeout_ms,
                &ids,
            )
            .await?;

        let jobs: Vec<QueuedJob> = claimed
            .ids
            .iter()
            .map(|entry| {
                let delivered = expired
                    .iter()
                    .find(|(id, _)| *id == entry.id)
                    .map(|(_, n)| *n as u32)
                    .unwrap_or(1);
                parse_entry(entry, delivered + 1)
            })
            .collect();

        if !jobs.is_empty() {
            warn!(count = jobs.len(), "Reclaimed jobs past visibility timeout");
        }

        Ok(jobs)
    }

    async fn read_new(&self, max: usize, block: bool) -> Result<Vec<QueuedJob>, QueueError> {
        let mut conn = self.redis.clone();

        let mut opts = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_id)
            .count(max);
        if block {
            opts = opts.block(self.config.block_ms);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream_name], &[">"], &opts)
            .await?;

        Ok(reply
            .map(|r| {
                r.keys
                    .iter()
                    .flat_map(|key| key.ids.iter().map(|entry| parse_entry(entry, 1)))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Remove the entry from the stream and store a record that expires on its own.
    async fn finish(
        &self,
        job: &QueuedJob,
        key: String,
        record: &JobRecord,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let record = serde_json::to_string(record)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&job.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(&job.id)
            .ignore()
            .cmd("SET")
            .arg(&key)
            .arg(&record)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .ignore();

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

/// Build a job from a stream entry. Missing fields become empty strings so
/// the handler sees (and dead-letters) the malformed job.
fn parse_entry(entry: &StreamId, attempt: u32) -> QueuedJob {
    let defaults = JobRetention::default();
    let retention = JobRetention {
        remove_on_complete: entry
            .get::<u64>("completed_ttl")
            .map(Duration::from_secs)
            .unwrap_or(defaults.remove_on_complete),
        remove_on_fail: entry
            .get::<u64>("failed_ttl")
            .map(Duration::from_secs)
            .unwrap_or(defaults.remove_on_fail),
    };

    QueuedJob {
        id: entry.id.clone(),
        name: entry.get("name").unwrap_or_default(),
        payload: entry.get("payload").unwrap_or_default(),
        attempt,
        retention,
    }
}

#[async_trait]
impl JobQueue for RedisStreamQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: &str,
        retention: JobRetention,
    ) -> Result<String, QueueError> {
        let mut conn = self.redis.clone();

        let id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_length)
            .arg("*")
            .arg("name")
            .arg(name)
            .arg("payload")
            .arg(payload)
            .arg("completed_ttl")
            .arg(retention.remove_on_complete.as_secs())
            .arg("failed_ttl")
            .arg(retention.remove_on_fail.as_secs())
            .query_async(&mut conn)
            .await?;

        debug!(stream = %self.config.stream_name, job_id = %id, job_name = %name, "Enqueued job");
        Ok(id)
    }

    async fn fetch(&self, max: usize) -> Result<Vec<QueuedJob>, QueueError> {
        if max == 0 {
            return Ok(vec![]);
        }

        let mut jobs = match self.claim_expired(max).await {
            Ok(jobs) => jobs,
            Err(e) if e.is_nogroup_error() => {
                self.ensure_consumer_group().await?;
                vec![]
            }
            Err(e) => return Err(e),
        };

        let remaining = max - jobs.len().min(max);
        if remaining > 0 {
            // Only block when there is nothing to hand back already.
            let fresh = self.read_new(remaining, jobs.is_empty()).await?;
            jobs.extend(fresh);
        }

        Ok(jobs)
    }

    async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let key = self.config.completed_key(&job.id);
        self.finish(job, key, &JobRecord::completed(job), job.retention.remove_on_complete)
            .await?;
        debug!(job_id = %job.id, "Acknowledged job");
        Ok(())
    }

    async fn nack(&self, job: &QueuedJob, reason: &str) -> Result<(), QueueError> {
        // The entry stays pending; claim_expired hands it out again.
        warn!(
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempt,
            visibility_timeout_ms = self.config.visibility_timeout_ms,
            reason = %reason,
            "Job released for redelivery"
        );
        Ok(())
    }

    async fn dead_letter(&self, job: &QueuedJob, reason: &str) -> Result<(), QueueError> {
        let key = self.config.failed_key(&job.id);
        self.finish(job, key, &JobRecord::failed(job, reason), job.retention.remove_on_fail)
            .await?;
        warn!(job_id = %job.id, job_name = %job.name, reason = %reason, "Job dead-lettered");
        Ok(())
    }
}
