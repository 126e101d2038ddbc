//! Notification store: persistence for in-app notifications.
//!
//! Rows are inserted once per matched recipient, read newest-first with an
//! opaque `(created_at, id)` cursor, flipped to read by their owner, and
//! purged by age regardless of read state.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use tally_common::error::AppError;
use tally_common::types::{Notification, NotificationType};

/// Page size when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: i64 = 100;

/// Rows per multi-row `INSERT`, well under the Postgres bind limit.
const INSERT_CHUNK: usize = 1_000;

/// Content shared by every recipient of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub workspace_id: Option<Uuid>,
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    pub data: Option<serde_json::Value>,
}

/// Parameters for creating a single notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNotificationParams {
    pub user_id: Uuid,
    pub content: NotificationContent,
}

/// One page of a user's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    /// Pass back to fetch the next (older) page.
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Position in the `(created_at DESC, id DESC)` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn after(notification: &Notification) -> Self {
        Self {
            created_at: notification.created_at,
            id: notification.id,
        }
    }

    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.created_at.timestamp_micros(), self.id);
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(encoded: &str) -> Result<Self, AppError> {
        let invalid = || AppError::Validation(format!("Invalid cursor '{}'", encoded));

        let bytes = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (micros, id) = raw.split_once(':').ok_or_else(invalid)?;

        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let created_at = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(invalid)?;
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;

        Ok(Self { created_at, id })
    }

    /// Whether `notification` sorts strictly after this cursor (is older).
    pub fn precedes(&self, notification: &Notification) -> bool {
        (notification.created_at, notification.id) < (self.created_at, self.id)
    }
}

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`.
pub fn page_size(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Split an over-fetched result (`limit + 1` rows) into a page.
pub fn into_page(mut rows: Vec<Notification>, limit: i64) -> NotificationPage {
    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    let next_cursor = if has_more {
        rows.last().map(|n| Cursor::after(n).encode())
    } else {
        None
    };

    NotificationPage {
        items: rows,
        next_cursor,
        has_more,
    }
}

/// Creation timestamp at the precision Postgres stores.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Cutoff for a retention purge; rows strictly older are deleted.
pub fn retention_cutoff(retention_days: i64) -> Result<DateTime<Utc>, AppError> {
    if retention_days < 0 {
        return Err(AppError::Validation(format!(
            "retention_days must be non-negative, got {}",
            retention_days
        )));
    }
    Ok(Utc::now() - chrono::Duration::days(retention_days))
}

/// Persistence operations on notifications.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create_notification(
        &self,
        params: &CreateNotificationParams,
    ) -> Result<Notification, AppError>;

    /// Insert one row per user. An empty `user_ids` performs no I/O.
    async fn create_notifications(
        &self,
        user_ids: &[Uuid],
        content: &NotificationContent,
    ) -> Result<Vec<Notification>, AppError>;

    async fn find_by_user_with_cursor(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<NotificationPage, AppError>;

    async fn has_unread(&self, user_id: Uuid) -> Result<bool, AppError>;

    async fn count_unread(&self, user_id: Uuid) -> Result<i64, AppError>;

    /// Mark one notification read. Returns `false` when `id` does not exist
    /// or belongs to someone else.
    async fn mark_as_read(&self, id: Uuid, user_id: Uuid) -> Result<bool, AppError>;

    async fn mark_all_as_read(&self, user_id: Uuid) -> Result<u64, AppError>;

    /// Delete rows created more than `retention_days` ago.
    async fn delete_old_notifications(&self, retention_days: i64) -> Result<u64, AppError>;
}

/// PostgreSQL-backed notification store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn create_notification(
        &self,
        params: &CreateNotificationParams,
    ) -> Result<Notification, AppError> {
        let content = &params.content;

        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications (id, user_id, workspace_id, type, title, body, is_read, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, false, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(params.user_id)
        .bind(content.workspace_id)
        .bind(content.kind.to_string())
        .bind(&content.title)
        .bind(&content.body)
        .bind(&content.data)
        .bind(now_micros())
        .fetch_one(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn create_notifications(
        &self,
        user_ids: &[Uuid],
        content: &NotificationContent,
    ) -> Result<Vec<Notification>, AppError> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }

        let now = now_micros();
        let kind = content.kind.to_string();
        let mut created = Vec::with_capacity(user_ids.len());

        for chunk in user_ids.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO notifications (id, user_id, workspace_id, type, title, body, is_read, data, created_at) ",
            );
            builder.push_values(chunk, |mut row, user_id| {
                row.push_bind(Uuid::new_v4())
                    .push_bind(*user_id)
                    .push_bind(content.workspace_id)
                    .push_bind(&kind)
                    .push_bind(&content.title)
                    .push_bind(&content.body)
                    .push_bind(false)
                    .push_bind(&content.data)
                    .push_bind(now);
            });
            builder.push(" RETURNING *");

            let rows: Vec<Notification> = builder.build_query_as().fetch_all(&self.pool).await?;
            created.extend(rows);
        }

        tracing::debug!(count = created.len(), kind = %content.kind, "Notifications created");
        Ok(created)
    }

    async fn find_by_user_with_cursor(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<NotificationPage, AppError> {
        let limit = page_size(limit);
        let cursor = cursor.map(Cursor::decode).transpose()?;

        let rows: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT *
            FROM notifications
            WHERE user_id = $1
              AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3))
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(cursor.map(|c| c.created_at))
        .bind(cursor.map(|c| c.id))
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        Ok(into_page(rows, limit))
    }

    async fn has_unread(&self, user_id: Uuid) -> Result<bool, AppError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM notifications WHERE user_id = $1 AND is_read = false)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn count_unread(&self, user_id: Uuid) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_read = false",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn mark_as_read(&self, id: Uuid, user_id: Uuid) -> Result<bool, AppError> {
        // Ownership lives in the predicate: a foreign id simply matches nothing.
        let result = sqlx::query("UPDATE notifications SET is_read = true WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_as_read(&self, user_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = true WHERE user_id = $1 AND is_read = false",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_old_notifications(&self, retention_days: i64) -> Result<u64, AppError> {
        let cutoff = retention_cutoff(retention_days)?;

        let result = sqlx::query("DELETE FROM notifications WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
