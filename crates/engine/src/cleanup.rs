//! Cleanup scheduler: periodic retention purge of old notifications.
//!
//! Runs once right away, then every 24 hours. Runs are independent: a failed
//! purge is logged and the next one still happens. Several processes may run
//! their own scheduler; deleting already-deleted rows is harmless.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tally_common::config::{CLEANUP_INTERVAL_SECS, NOTIFICATION_RETENTION_DAYS};
use tally_common::error::AppError;

use crate::notifications::NotificationStore;

pub struct CleanupScheduler {
    store: Arc<dyn NotificationStore>,
    interval: Duration,
    retention_days: i64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupScheduler {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self {
            store,
            interval: Duration::from_secs(CLEANUP_INTERVAL_SECS),
            retention_days: NOTIFICATION_RETENTION_DAYS,
            handle: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the periodic task. No-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let store = Arc::clone(&self.store);
        let period = self.interval;
        let retention_days = self.retention_days;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // The first tick completes immediately.
                ticker.tick().await;
                let _ = purge(store.as_ref(), retention_days).await;
            }
        }));

        tracing::info!(
            interval_secs = period.as_secs(),
            retention_days,
            "Notification cleanup scheduled"
        );
    }

    /// Cancel the pending run. No-op if not running.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            tracing::info!("Notification cleanup stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Purge once, outside the schedule.
    pub async fn run_once(&self) -> Result<u64, AppError> {
        purge(self.store.as_ref(), self.retention_days).await
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

async fn purge(store: &dyn NotificationStore, retention_days: i64) -> Result<u64, AppError> {
    match store.delete_old_notifications(retention_days).await {
        Ok(deleted) => {
            tracing::info!(deleted, retention_days, "Old notifications purged");
            Ok(deleted)
        }
        Err(e) => {
            tracing::error!(error = %e, retention_days, "Notification cleanup failed");
            Err(e)
        }
    }
}
