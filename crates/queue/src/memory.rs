//! In-process queue with the same delivery semantics as the Redis backend,
//! minus durability. A nacked job is immediately visible again with its
//! attempt counter bumped.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::QueueError;
use crate::job::{JobQueue, JobRecord, JobRetention, QueuedJob};

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    ready: VecDeque<QueuedJob>,
    in_flight: HashMap<String, QueuedJob>,
    completed: Vec<JobRecord>,
    failed: Vec<JobRecord>,
}

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs waiting to be fetched.
    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Jobs fetched but not yet finished.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn completed(&self) -> Vec<JobRecord> {
        self.state.lock().completed.clone()
    }

    pub fn failed(&self) -> Vec<JobRecord> {
        self.state.lock().failed.clone()
    }

    /// Snapshot of waiting jobs, oldest first.
    pub fn ready_jobs(&self) -> Vec<QueuedJob> {
        self.state.lock().ready.iter().cloned().collect()
    }

    fn take_in_flight(&self, job: &QueuedJob) -> Result<QueuedJob, QueueError> {
        self.state
            .lock()
            .in_flight
            .remove(&job.id)
            .ok_or_else(|| QueueError::UnknownJob(job.id.clone()))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: &str,
        retention: JobRetention,
    ) -> Result<String, QueueError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{}-0", state.next_id);
        state.ready.push_back(QueuedJob {
            id: id.clone(),
            name: name.to_string(),
            payload: payload.to_string(),
            attempt: 1,
            retention,
        });
        Ok(id)
    }

    async fn fetch(&self, max: usize) -> Result<Vec<QueuedJob>, QueueError> {
        let mut state = self.state.lock();
        let take = max.min(state.ready.len());
        let jobs: Vec<QueuedJob> = state.ready.drain(..take).collect();
        for job in &jobs {
            state.in_flight.insert(job.id.clone(), job.clone());
        }
        Ok(jobs)
    }

    async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let job = self.take_in_flight(job)?;
        self.state.lock().completed.push(JobRecord::completed(&job));
        Ok(())
    }

    async fn nack(&self, job: &QueuedJob, _reason: &str) -> Result<(), QueueError> {
        let mut job = self.take_in_flight(job)?;
        job.attempt += 1;
        self.state.lock().ready.push_back(job);
        Ok(())
    }

    async fn dead_letter(&self, job: &QueuedJob, reason: &str) -> Result<(), QueueError> {
        let job = self.take_in_flight(job)?;
        self.state.lock().failed.push(JobRecord::failed(&job, reason));
        Ok(())
    }
}
