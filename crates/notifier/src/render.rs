//! Turn an event into human-readable notification content.

use serde_json::{Value, json};
use uuid::Uuid;

use tally_common::types::{ActionEvent, NotificationType};
use tally_engine::notifications::NotificationContent;

/// Read a payload field as display text. Numbers are rendered as-is.
fn field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn amount(payload: &Value) -> Option<String> {
    let amount = field(payload, "amount")?;
    Some(match field(payload, "currency") {
        Some(currency) => format!("{} {}", amount, currency),
        None => amount,
    })
}

/// In-app link for the event's aggregate.
pub fn url(workspace_id: Uuid, event: &ActionEvent) -> String {
    let base = format!("/workspaces/{}", workspace_id);
    match event.aggregate_type.as_str() {
        "log" => format!("{}/logs/{}", base, event.aggregate_id),
        "settlement" => format!("{}/settlements/{}", base, event.aggregate_id),
        "member" => format!("{}/members", base),
        _ => base,
    }
}

/// Render title, body and deep-link data shared by every recipient.
pub fn render(
    event: &ActionEvent,
    kind: NotificationType,
    workspace_id: Uuid,
) -> NotificationContent {
    let p = &event.payload;
    let actor = field(p, "actorName").unwrap_or_else(|| "Someone".to_string());
    let description = field(p, "description").unwrap_or_else(|| "an expense".to_string());
    let from = field(p, "fromUserName").unwrap_or_else(|| "someone".to_string());
    let to = field(p, "toUserName").unwrap_or_else(|| "someone".to_string());
    let member = field(p, "memberName").unwrap_or_else(|| "A member".to_string());

    let (title, body) = match kind {
        NotificationType::LogCreated => (
            "New expense",
            match amount(p) {
                Some(amount) => format!("{} added {} ({})", actor, description, amount),
                None => format!("{} added {}", actor, description),
            },
        ),
        NotificationType::LogUpdated => ("Expense updated", format!("{} updated {}", actor, description)),
        NotificationType::LogDeleted => ("Expense deleted", format!("{} deleted {}", actor, description)),
        NotificationType::SettlementCreated => (
            "Settlement recorded",
            match amount(p) {
                Some(amount) => format!("{} paid {} {}", from, to, amount),
                None => format!("{} paid {}", from, to),
            },
        ),
        NotificationType::SettlementUpdated => (
            "Settlement updated",
            format!("{} updated a settlement from {} to {}", actor, from, to),
        ),
        NotificationType::SettlementDeleted => (
            "Settlement removed",
            format!("{} removed a settlement from {} to {}", actor, from, to),
        ),
        NotificationType::MemberJoined => ("New member", format!("{} joined the workspace", member)),
        NotificationType::MemberUpdated => ("Member updated", format!("{} updated {}", actor, member)),
        NotificationType::MemberLeft => ("Member left", format!("{} left the workspace", member)),
    };

    NotificationContent {
        workspace_id: Some(workspace_id),
        kind,
        title: title.to_string(),
        body,
        data: Some(json!({
            "workspaceId": workspace_id,
            "aggregateType": event.aggregate_type,
            "aggregateId": event.aggregate_id,
            "action": event.action,
            "url": url(workspace_id, event),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_common::types::ActionType;

    fn event(aggregate_type: &str, action: ActionType, payload: Value) -> ActionEvent {
        ActionEvent {
            action,
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: "agg-1".to_string(),
            payload,
            user_id: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_log_created_with_amount() {
        let ws = Uuid::new_v4();
        let e = event(
            "log",
            ActionType::Created,
            json!({ "actorName": "Alice", "description": "Groceries", "amount": 42.5, "currency": "EUR" }),
        );
        let content = render(&e, NotificationType::LogCreated, ws);
        assert_eq!(content.title, "New expense");
        assert_eq!(content.body, "Alice added Groceries (42.5 EUR)");
        assert_eq!(content.workspace_id, Some(ws));
    }

    #[test]
    fn test_missing_fields_use_placeholders() {
        let e = event("settlement", ActionType::Created, json!({}));
        let content = render(&e, NotificationType::SettlementCreated, Uuid::new_v4());
        assert_eq!(content.body, "someone paid someone");

        let e = event("member", ActionType::Created, json!({ "memberName": "  " }));
        let content = render(&e, NotificationType::MemberJoined, Uuid::new_v4());
        assert_eq!(content.body, "A member joined the workspace");
    }

    #[test]
    fn test_data_links_to_aggregate() {
        let ws = Uuid::new_v4();
        let e = event("settlement", ActionType::Deleted, json!({}));
        let content = render(&e, NotificationType::SettlementDeleted, ws);
        let data = content.data.unwrap();

        assert_eq!(data["aggregateId"], "agg-1");
        assert_eq!(data["action"], "deleted");
        assert_eq!(data["url"], format!("/workspaces/{}/settlements/agg-1", ws));

        let e = event("member", ActionType::Updated, json!({}));
        assert_eq!(url(ws, &e), format!("/workspaces/{}/members", ws));
    }
}
