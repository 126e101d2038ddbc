//! Recipient resolution against workspace notification settings.
//!
//! Settings and membership are owned by the workspace domain; this module
//! only reads them. A member is a candidate for an event when their row for
//! the event's workspace lists the event's notification type.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use tally_common::error::AppError;
use tally_common::types::{EnabledMember, NotificationType};

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Members of `workspace_id` who enabled `kind`, minus `exclude_user_id`.
    async fn find_enabled_members_for_notification(
        &self,
        workspace_id: Uuid,
        kind: NotificationType,
        exclude_user_id: Option<Uuid>,
    ) -> Result<Vec<EnabledMember>, AppError>;
}

/// Reads `notification_settings` joined with `workspace_members`.
#[derive(Clone)]
pub struct PgSettingsProvider {
    pool: PgPool,
}

impl PgSettingsProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsProvider for PgSettingsProvider {
    async fn find_enabled_members_for_notification(
        &self,
        workspace_id: Uuid,
        kind: NotificationType,
        exclude_user_id: Option<Uuid>,
    ) -> Result<Vec<EnabledMember>, AppError> {
        // Former members may still have a settings row; the join drops them.
        let members: Vec<EnabledMember> = sqlx::query_as(
            r#"
            SELECT ns.user_id,
                   ns.web_push_enabled,
                   ns.slack_enabled,
                   ns.slack_webhook_url AS webhook_url
            FROM notification_settings ns
            JOIN workspace_members wm
              ON wm.workspace_id = ns.workspace_id
             AND wm.user_id = ns.user_id
            WHERE ns.workspace_id = $1
              AND $2 = ANY(ns.enabled_types)
              AND ($3::uuid IS NULL OR ns.user_id <> $3)
            "#,
        )
        .bind(workspace_id)
        .bind(kind.to_string())
        .bind(exclude_user_id)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(
            workspace_id = %workspace_id,
            kind = %kind,
            recipients = members.len(),
            "Resolved notification recipients"
        );

        Ok(members)
    }
}
