//! Queue job handler that turns one event into notifications.
//!
//! Persistence happens before any delivery. Once the rows are written the
//! job is acknowledged no matter what the channels report; only a failure to
//! resolve recipients or to persist makes the queue redeliver.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_common::context::JobContext;
use tally_common::error::AppError;
use tally_common::types::{ActionEvent, EnabledMember, NotificationType};
use tally_engine::cache::{CacheClient, invalidate_unread};
use tally_engine::notifications::NotificationStore;
use tally_engine::settings::SettingsProvider;
use tally_queue::{JobHandler, JobOutcome, QueuedJob};

use crate::push::{PushChannel, PushPayload};
use crate::render::render;
use crate::webhook::{WebhookChannel, WebhookMessage};

/// Per-job delivery summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub recipients: usize,
    pub notifications_created: usize,
    pub push_sent: usize,
    pub push_failed: usize,
    pub push_pruned: u64,
    pub webhook_sent: usize,
    pub webhook_failed: usize,
}

#[derive(Default)]
struct UserPush {
    sent: usize,
    failed: usize,
    pruned: u64,
}

pub struct NotificationWorker {
    settings: Arc<dyn SettingsProvider>,
    notifications: Arc<dyn NotificationStore>,
    cache: Arc<dyn CacheClient>,
    push: Arc<PushChannel>,
    webhook: WebhookChannel,
    exclude_actor: bool,
}

impl NotificationWorker {
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        notifications: Arc<dyn NotificationStore>,
        cache: Arc<dyn CacheClient>,
        push: Arc<PushChannel>,
        webhook: WebhookChannel,
    ) -> Self {
        Self {
            settings,
            notifications,
            cache,
            push,
            webhook,
            exclude_actor: true,
        }
    }

    /// Whether the user who triggered the event is left out of recipients.
    pub fn with_exclude_actor(mut self, exclude_actor: bool) -> Self {
        self.exclude_actor = exclude_actor;
        self
    }

    /// Process one decoded event.
    pub async fn process(&self, event: &ActionEvent) -> Result<FanOutReport, AppError> {
        let Some(kind) = NotificationType::from_event(&event.aggregate_type, event.action) else {
            debug!(
                aggregate_type = %event.aggregate_type,
                action = %event.action,
                "Event has no notification type, skipping"
            );
            return Ok(FanOutReport::default());
        };

        let workspace_id = event.workspace_id().ok_or_else(|| {
            AppError::MalformedEvent(format!(
                "{} event {} has no valid payload.workspaceId",
                event.job_name(),
                event.aggregate_id
            ))
        })?;

        let exclude = if self.exclude_actor { event.user_id } else { None };
        // Recipients are the union of the push- and webhook-eligible members.
        let members: Vec<EnabledMember> = self
            .settings
            .find_enabled_members_for_notification(workspace_id, kind, exclude)
            .await?
            .into_iter()
            .filter(|m| m.push_eligible() || m.webhook_target().is_some())
            .collect();

        if members.is_empty() {
            debug!(workspace_id = %workspace_id, kind = %kind, "No recipients");
            return Ok(FanOutReport::default());
        }

        let content = render(event, kind, workspace_id);
        let user_ids: Vec<Uuid> = members.iter().map(|m| m.user_id).collect();

        let created = self
            .notifications
            .create_notifications(&user_ids, &content)
            .await?;

        invalidate_unread(self.cache.as_ref(), &user_ids).await;

        let mut report = FanOutReport {
            recipients: members.len(),
            notifications_created: created.len(),
            ..Default::default()
        };
        let payload = PushPayload::from_content(&content);
        let message = WebhookMessage::from_content(&content);
        self.dispatch(&members, &payload, &message, &mut report).await;

        Ok(report)
    }

    async fn dispatch(
        &self,
        members: &[EnabledMember],
        payload: &PushPayload,
        message: &WebhookMessage,
        report: &mut FanOutReport,
    ) {
        let push_targets = members.iter().filter(|m| m.push_eligible()).map(|m| m.user_id);
        let webhook_targets: Vec<String> = members
            .iter()
            .filter_map(|m| m.webhook_target())
            .map(str::to_string)
            .collect();

        let (pushes, webhooks) = tokio::join!(
            join_all(push_targets.map(|user_id| self.push_to_user(user_id, payload))),
            self.webhook.send_to_many(&webhook_targets, message),
        );

        for push in pushes {
            report.push_sent += push.sent;
            report.push_failed += push.failed;
            report.push_pruned += push.pruned;
        }
        report.webhook_sent = webhooks.sent_count;
        report.webhook_failed = webhooks.failed_count;
    }

    /// Push to one recipient, then prune subscriptions reported gone.
    async fn push_to_user(&self, user_id: Uuid, payload: &PushPayload) -> UserPush {
        let report = match self.push.send_to_user(user_id, payload).await {
            Ok(report) => report,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Push dispatch failed");
                return UserPush {
                    failed: 1,
                    ..Default::default()
                };
            }
        };

        let pruned = match self.push.prune(&report.failed_subscription_ids).await {
            Ok(n) => n,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to prune push subscriptions");
                0
            }
        };

        UserPush {
            sent: report.sent_count,
            failed: report.failed_subscription_ids.len() + report.transient_failures,
            pruned,
        }
    }
}

#[async_trait]
impl JobHandler for NotificationWorker {
    async fn handle(&self, job: &QueuedJob, ctx: &JobContext) -> JobOutcome {
        let event: ActionEvent = match serde_json::from_str(&job.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed event payload");
                return JobOutcome::Dead(format!("malformed event: {}", e));
            }
        };

        match self.process(&event).await {
            Ok(report) => {
                info!(
                    attempt = ctx.attempt,
                    recipients = report.recipients,
                    notifications_created = report.notifications_created,
                    push_sent = report.push_sent,
                    push_failed = report.push_failed,
                    push_pruned = report.push_pruned,
                    webhook_sent = report.webhook_sent,
                    webhook_failed = report.webhook_failed,
                    "Event fanned out"
                );
                JobOutcome::Ack
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, attempt = ctx.attempt, "Event processing failed, will retry");
                JobOutcome::Retry(e.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Event rejected");
                JobOutcome::Dead(e.to_string())
            }
        }
    }

    fn name(&self) -> &'static str {
        "notification_worker"
    }
}
