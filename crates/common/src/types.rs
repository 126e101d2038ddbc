use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of change carried by an [`ActionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Created,
    Updated,
    Deleted,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Created => write!(f, "created"),
            ActionType::Updated => write!(f, "updated"),
            ActionType::Deleted => write!(f, "deleted"),
        }
    }
}

/// A domain occurrence published for asynchronous fan-out.
///
/// This is the queue payload, serialized as camelCase JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    #[serde(rename = "type")]
    pub action: ActionType,
    pub aggregate_type: String,
    pub aggregate_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl ActionEvent {
    /// Queue job name, `"<aggregateType>.<type>"`.
    pub fn job_name(&self) -> String {
        format!("{}.{}", self.aggregate_type, self.action)
    }

    /// Workspace the event belongs to, read from `payload.workspaceId`.
    pub fn workspace_id(&self) -> Option<Uuid> {
        self.payload
            .get("workspaceId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// An event as handed to the producer, before a timestamp is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewActionEvent {
    #[serde(rename = "type")]
    pub action: ActionType,
    pub aggregate_type: String,
    pub aggregate_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

impl NewActionEvent {
    pub fn stamp(self, timestamp: DateTime<Utc>) -> ActionEvent {
        ActionEvent {
            action: self.action,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            payload: self.payload,
            user_id: self.user_id,
            timestamp,
        }
    }
}

/// Types of in-app notification a member can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    // Expense log entries
    LogCreated,
    LogUpdated,
    LogDeleted,

    // Settlements
    SettlementCreated,
    SettlementUpdated,
    SettlementDeleted,

    // Membership
    MemberJoined,
    MemberUpdated,
    MemberLeft,
}

impl NotificationType {
    /// Map an event onto the notification type members subscribe to.
    ///
    /// Returns `None` for aggregates nobody can be notified about.
    pub fn from_event(aggregate_type: &str, action: ActionType) -> Option<Self> {
        let kind = match (aggregate_type, action) {
            ("log", ActionType::Created) => NotificationType::LogCreated,
            ("log", ActionType::Updated) => NotificationType::LogUpdated,
            ("log", ActionType::Deleted) => NotificationType::LogDeleted,
            ("settlement", ActionType::Created) => NotificationType::SettlementCreated,
            ("settlement", ActionType::Updated) => NotificationType::SettlementUpdated,
            ("settlement", ActionType::Deleted) => NotificationType::SettlementDeleted,
            ("member", ActionType::Created) => NotificationType::MemberJoined,
            ("member", ActionType::Updated) => NotificationType::MemberUpdated,
            ("member", ActionType::Deleted) => NotificationType::MemberLeft,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::LogCreated => write!(f, "log_created"),
            NotificationType::LogUpdated => write!(f, "log_updated"),
            NotificationType::LogDeleted => write!(f, "log_deleted"),
            NotificationType::SettlementCreated => write!(f, "settlement_created"),
            NotificationType::SettlementUpdated => write!(f, "settlement_updated"),
            NotificationType::SettlementDeleted => write!(f, "settlement_deleted"),
            NotificationType::MemberJoined => write!(f, "member_joined"),
            NotificationType::MemberUpdated => write!(f, "member_updated"),
            NotificationType::MemberLeft => write!(f, "member_left"),
        }
    }
}

/// A persisted in-app notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub workspace_id: Option<Uuid>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A browser push registration. The endpoint is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PushSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub created_at: DateTime<Utc>,
}

/// A workspace member whose settings enable a given notification type.
///
/// Read-only view over the settings owned by the workspace domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EnabledMember {
    pub user_id: Uuid,
    pub web_push_enabled: bool,
    pub slack_enabled: bool,
    pub webhook_url: Option<String>,
}

impl EnabledMember {
    pub fn push_eligible(&self) -> bool {
        self.web_push_enabled
    }

    /// Slack delivery needs both the toggle and a configured target.
    pub fn webhook_target(&self) -> Option<&str> {
        if !self.slack_enabled {
            return None;
        }
        self.webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}
