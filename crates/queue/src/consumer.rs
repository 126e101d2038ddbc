//! Bounded-concurrency consumer loop.
//!
//! Maps each [`JobOutcome`] onto the queue: `Ack` → ack, `Retry` → nack
//! (redelivery), `Dead` → dead letter. Jobs delivered more than
//! `max_deliveries` times are dead-lettered without being handled again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::QueueError;
use crate::job::{JobHandler, JobOutcome, JobQueue, QueuedJob};

const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Jobs handled at the same time.
    pub concurrency: usize,
    pub max_deliveries: u32,
    /// Pause after an empty fetch. Blocking backends mostly wait server-side.
    pub idle_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_deliveries: 5,
            idle_interval: Duration::from_millis(200),
        }
    }
}

pub struct QueueConsumer<H: JobHandler> {
    queue: Arc<dyn JobQueue>,
    handler: Arc<H>,
    config: ConsumerConfig,
    permits: Arc<Semaphore>,
}

impl<H: JobHandler> QueueConsumer<H> {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<H>, config: ConsumerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            queue,
            handler,
            config,
            permits,
        }
    }

    /// Consume until `shutdown` flips to `true`, then wait for in-flight jobs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(
            handler = self.handler.name(),
            concurrency = self.config.concurrency,
            max_deliveries = self.config.max_deliveries,
            "Queue consumer started"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping consumer");
                break;
            }

            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "Job task panicked");
                }
            }

            let free = self.permits.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = tasks.join_next() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let jobs = match self.queue.fetch(free).await {
                Ok(jobs) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Queue connection recovered");
                        consecutive_errors = 0;
                    }
                    jobs
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                    if e.is_connection_error() {
                        warn!(error = %e, consecutive_errors, backoff_secs, "Queue connection error, backing off");
                    } else {
                        error!(error = %e, consecutive_errors, backoff_secs, "Failed to fetch jobs");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for job in jobs {
                let Ok(permit) = self.permits.clone().acquire_owned().await else {
                    break;
                };
                let queue = Arc::clone(&self.queue);
                let handler = Arc::clone(&self.handler);
                let max_deliveries = self.config.max_deliveries;
                tasks.spawn(async move {
                    process_job(queue.as_ref(), handler.as_ref(), job, max_deliveries).await;
                    drop(permit);
                });
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight jobs");
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Job task panicked");
            }
        }

        info!("Queue consumer stopped");
        Ok(())
    }

    /// Fetch one batch and handle it to completion. Returns the batch size.
    pub async fn run_once(&self) -> Result<usize, QueueError> {
        let jobs = self.queue.fetch(self.config.concurrency.max(1)).await?;
        let count = jobs.len();

        futures::future::join_all(jobs.into_iter().map(|job| {
            process_job(
                self.queue.as_ref(),
                self.handler.as_ref(),
                job,
                self.config.max_deliveries,
            )
        }))
        .await;

        Ok(count)
    }
}

/// Handle a single delivery and settle it on the queue.
///
/// A failure to settle leaves the job pending; the queue redelivers it.
async fn process_job<H: JobHandler>(
    queue: &dyn JobQueue,
    handler: &H,
    job: QueuedJob,
    max_deliveries: u32,
) {
    let ctx = job.context();
    let span = ctx.span();

    async {
        if job.attempt > max_deliveries {
            let reason = format!("exceeded {} deliveries", max_deliveries);
            if let Err(e) = queue.dead_letter(&job, &reason).await {
                error!(error = %e, "Failed to dead-letter exhausted job");
            }
            return;
        }

        let settled = match handler.handle(&job, &ctx).await {
            JobOutcome::Ack => queue.ack(&job).await,
            JobOutcome::Retry(reason) => queue.nack(&job, &reason).await,
            JobOutcome::Dead(reason) => queue.dead_letter(&job, &reason).await,
        };

        match settled {
            Ok(()) => debug!("Job settled"),
            Err(e) => error!(error = %e, "Failed to settle job"),
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRetention;
    use crate::memory::MemoryQueue;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tally_common::context::JobContext;

    /// Handler returning a scripted outcome per payload.
    struct ScriptedHandler {
        seen: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &QueuedJob, ctx: &JobContext) -> JobOutcome {
            self.seen.lock().push((job.payload.clone(), ctx.attempt));
            match job.payload.as_str() {
                "ok" => JobOutcome::Ack,
                "flaky" if ctx.attempt < 2 => JobOutcome::Retry("db down".to_string()),
                "flaky" => JobOutcome::Ack,
                "retry" => JobOutcome::Retry("always".to_string()),
                _ => JobOutcome::Dead("malformed".to_string()),
            }
        }

        fn name(&self) -> &'static str {
            "ScriptedHandler"
        }
    }

    fn consumer(queue: Arc<MemoryQueue>, max_deliveries: u32) -> (QueueConsumer<ScriptedHandler>, Arc<ScriptedHandler>) {
        let handler = Arc::new(ScriptedHandler {
            seen: Mutex::new(Vec::new()),
        });
        let config = ConsumerConfig {
            concurrency: 4,
            max_deliveries,
            idle_interval: Duration::from_millis(5),
        };
        (QueueConsumer::new(queue, Arc::clone(&handler), config), handler)
    }

    #[tokio::test]
    async fn test_outcomes_map_to_queue_operations() {
        let queue = Arc::new(MemoryQueue::new());
        for payload in ["ok", "flaky", "garbage"] {
            queue.enqueue("log.created", payload, JobRetention::default()).await.unwrap();
        }
        let (consumer, handler) = consumer(Arc::clone(&queue), 5);

        assert_eq!(consumer.run_once().await.unwrap(), 3);
        assert_eq!(queue.completed().len(), 1);
        assert_eq!(queue.failed().len(), 1);
        assert_eq!(queue.ready_len(), 1);

        // the flaky job comes back once and succeeds
        assert_eq!(consumer.run_once().await.unwrap(), 1);
        assert_eq!(queue.completed().len(), 2);
        assert!(handler.seen.lock().contains(&("flaky".to_string(), 2)));
    }

    #[tokio::test]
    async fn test_exhausted_job_is_dead_lettered_without_handling() {
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue("log.created", "retry", JobRetention::default()).await.unwrap();
        let (consumer, handler) = consumer(Arc::clone(&queue), 2);

        for _ in 0..3 {
            consumer.run_once().await.unwrap();
        }

        assert_eq!(handler.seen.lock().len(), 2);
        let failed = queue.failed();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].reason.as_deref().unwrap().contains("exceeded"));
        assert_eq!(queue.ready_len(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(MemoryQueue::new());
        for _ in 0..10 {
            queue.enqueue("log.created", "ok", JobRetention::default()).await.unwrap();
        }
        let (consumer, _handler) = consumer(Arc::clone(&queue), 5);
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn(async move { consumer.run(rx).await });
        for _ in 0..100 {
            if queue.completed().len() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        run.await.unwrap().unwrap();
        assert_eq!(queue.completed().len(), 10);
        assert_eq!(queue.in_flight_len(), 0);
    }
}
