//! Event producer: the only way business logic hands events to the notifier.

use std::sync::Arc;

use tally_common::error::AppError;
use tally_common::types::{ActionEvent, NewActionEvent};
use tally_queue::{JobQueue, JobRetention};

/// Stamps domain events and enqueues them for the notification worker.
#[derive(Clone)]
pub struct EventProducer {
    queue: Arc<dyn JobQueue>,
    retention: JobRetention,
}

impl EventProducer {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            retention: JobRetention::default(),
        }
    }

    /// Publish an event. The timestamp is assigned here, never by the caller.
    ///
    /// Returns the queue job id. Success means the queue accepted the write,
    /// nothing more; enqueue failures are returned to the caller.
    pub async fn publish(&self, event: NewActionEvent) -> Result<String, AppError> {
        let event: ActionEvent = event.stamp(chrono::Utc::now());
        let name = event.job_name();
        let payload = serde_json::to_string(&event)
            .map_err(|e| AppError::Internal(format!("failed to encode event: {}", e)))?;

        let job_id = self.queue.enqueue(&name, &payload, self.retention).await?;

        tracing::debug!(
            job_id = %job_id,
            job_name = %name,
            aggregate_id = %event.aggregate_id,
            "Event published"
        );

        Ok(job_id)
    }
}
