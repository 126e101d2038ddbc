//! End-to-end fan-out scenarios over in-memory stores and queue.
//!
//! Events go through the real producer, queue consumer and worker; only the
//! push transport is replaced so deliveries can be observed.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use tally_common::types::{ActionType, NewActionEvent, NotificationType, PushSubscription};
use tally_engine::cache::{CacheClient, UNREAD_FLAG_TTL, unread_key};
use tally_engine::memory::{
    MemberSettings, MemoryCache, MemoryNotificationStore, MemorySettings, MemorySubscriptionStore,
};
use tally_engine::producer::EventProducer;
use tally_engine::subscriptions::{RegisterSubscriptionParams, SubscriptionStore};
use tally_notifier::{NotificationWorker, PushChannel, PushError, PushTransport, WebhookChannel};
use tally_queue::{ConsumerConfig, JobQueue, JobRetention, MemoryQueue, QueueConsumer};

// ============================================================
// Shared helpers
// ============================================================

/// Records every delivery attempt; endpoints in `gone` fail permanently.
#[derive(Default)]
struct RecordingTransport {
    attempts: Mutex<Vec<String>>,
    gone: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    fn mark_gone(&self, endpoint: &str) {
        self.gone.lock().insert(endpoint.to_string());
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn send(&self, sub: &PushSubscription, _payload: &[u8]) -> Result<(), PushError> {
        self.attempts.lock().push(sub.endpoint.clone());
        if self.gone.lock().contains(&sub.endpoint) {
            return Err(PushError::Permanent("410 Gone".to_string()));
        }
        Ok(())
    }
}

struct Harness {
    queue: Arc<MemoryQueue>,
    producer: EventProducer,
    consumer: QueueConsumer<NotificationWorker>,
    notifications: Arc<MemoryNotificationStore>,
    subscriptions: Arc<MemorySubscriptionStore>,
    settings: Arc<MemorySettings>,
    cache: Arc<MemoryCache>,
    transport: Arc<RecordingTransport>,
}

impl Harness {
    fn new() -> Self {
        let queue = Arc::new(MemoryQueue::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let subscriptions = Arc::new(MemorySubscriptionStore::new());
        let settings = Arc::new(MemorySettings::new());
        let cache = Arc::new(MemoryCache::new());
        let transport = Arc::new(RecordingTransport::default());

        let push = Arc::new(PushChannel::new(
            subscriptions.clone(),
            transport.clone(),
            "BTestPublicKey",
        ));
        let worker = NotificationWorker::new(
            settings.clone(),
            notifications.clone(),
            cache.clone(),
            push,
            WebhookChannel::new().unwrap(),
        );
        let consumer = QueueConsumer::new(queue.clone(), Arc::new(worker), ConsumerConfig::default());

        Self {
            producer: EventProducer::new(queue.clone()),
            queue,
            consumer,
            notifications,
            subscriptions,
            settings,
            cache,
            transport,
        }
    }

    fn member(&self, workspace: Uuid, user: Uuid, types: &[NotificationType], webhook: Option<&str>) {
        self.settings.add_member(
            workspace,
            MemberSettings {
                user_id: user,
                web_push_enabled: true,
                slack_enabled: webhook.is_some(),
                webhook_url: webhook.map(str::to_string),
                enabled_types: types.iter().copied().collect(),
            },
        );
    }

    async fn subscribe(&self, user: Uuid, endpoint: &str) -> Uuid {
        let params = RegisterSubscriptionParams {
            endpoint: endpoint.to_string(),
            p256dh: "BKey".to_string(),
            auth: "secret".to_string(),
        };
        self.subscriptions.upsert(user, &params).await.unwrap().id
    }

    async fn drain(&self) {
        while self.consumer.run_once().await.unwrap() > 0 {}
    }
}

fn log_created(workspace: Uuid, actor: Uuid) -> NewActionEvent {
    NewActionEvent {
        action: ActionType::Created,
        aggregate_type: "log".to_string(),
        aggregate_id: Uuid::new_v4().to_string(),
        payload: json!({
            "workspaceId": workspace,
            "description": "Groceries",
            "amount": "42.50",
            "currency": "EUR",
            "actorName": "Alice",
        }),
        user_id: Some(actor),
    }
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
async fn test_actor_excluded_and_single_push() {
    let h = Harness::new();
    let workspace = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    h.member(workspace, a, &[NotificationType::LogCreated], None);
    h.member(workspace, b, &[NotificationType::LogCreated], None);
    h.subscribe(a, "https://push.example.com/a").await;
    h.subscribe(b, "https://push.example.com/b").await;

    h.producer.publish(log_created(workspace, a)).await.unwrap();
    h.drain().await;

    let rows = h.notifications.all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].user_id, b);
    assert_eq!(rows[0].kind, NotificationType::LogCreated);
    assert_eq!(rows[0].body, "Alice added Groceries (42.50 EUR)");
    assert!(!rows[0].is_read);

    assert_eq!(h.transport.attempts(), vec!["https://push.example.com/b".to_string()]);
    assert_eq!(h.queue.completed().len(), 1);
}

#[tokio::test]
async fn test_member_without_channel_gets_no_row() {
    let h = Harness::new();
    let workspace = Uuid::new_v4();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    h.member(workspace, a, &[NotificationType::LogCreated], None);
    h.settings.add_member(
        workspace,
        MemberSettings {
            user_id: b,
            web_push_enabled: false,
            slack_enabled: false,
            webhook_url: None,
            enabled_types: [NotificationType::LogCreated].into_iter().collect(),
        },
    );
    // Slack toggled on but with a blank target is not a channel either.
    h.settings.add_member(
        workspace,
        MemberSettings {
            user_id: c,
            web_push_enabled: false,
            slack_enabled: true,
            webhook_url: Some("   ".to_string()),
            enabled_types: [NotificationType::LogCreated].into_iter().collect(),
        },
    );
    h.subscribe(a, "https://push.example.com/a").await;
    h.subscribe(b, "https://push.example.com/b").await;

    h.producer.publish(log_created(workspace, Uuid::new_v4())).await.unwrap();
    h.drain().await;

    assert_eq!(h.notifications.for_user(a).len(), 1);
    assert!(h.notifications.for_user(b).is_empty());
    assert!(h.notifications.for_user(c).is_empty());
    assert_eq!(h.transport.attempts(), vec!["https://push.example.com/a".to_string()]);
    assert_eq!(h.queue.completed().len(), 1);
}

#[tokio::test]
async fn test_malformed_payload_is_dead() {
    let h = Harness::new();
    h.queue
        .enqueue("log.created", "{not json", JobRetention::default())
        .await
        .unwrap();

    h.drain().await;

    assert!(h.notifications.is_empty());
    assert_eq!(h.queue.failed().len(), 1);
    assert_eq!(h.queue.ready_len(), 0);
    assert!(h.queue.completed().is_empty());
}

#[tokio::test]
async fn test_missing_workspace_is_dead() {
    let h = Harness::new();
    let mut event = log_created(Uuid::new_v4(), Uuid::new_v4());
    event.payload = json!({ "workspaceId": "not-a-uuid" });

    h.producer.publish(event).await.unwrap();
    h.drain().await;

    assert!(h.notifications.is_empty());
    assert_eq!(h.queue.failed().len(), 1);
}

#[tokio::test]
async fn test_unknown_aggregate_is_acked() {
    let h = Harness::new();
    let event = NewActionEvent {
        action: ActionType::Updated,
        aggregate_type: "workspace".to_string(),
        aggregate_id: "w-1".to_string(),
        payload: json!({}),
        user_id: None,
    };

    h.producer.publish(event).await.unwrap();
    h.drain().await;

    assert!(h.notifications.is_empty());
    assert_eq!(h.queue.completed().len(), 1);
    assert!(h.queue.failed().is_empty());
}

#[tokio::test]
async fn test_disabled_type_gets_no_row() {
    let h = Harness::new();
    let workspace = Uuid::new_v4();
    let subscriber = Uuid::new_v4();
    let muted = Uuid::new_v4();
    h.member(workspace, subscriber, &[NotificationType::LogCreated], None);
    h.member(workspace, muted, &[NotificationType::SettlementCreated], None);

    h.producer.publish(log_created(workspace, Uuid::new_v4())).await.unwrap();
    h.drain().await;

    assert_eq!(h.notifications.for_user(subscriber).len(), 1);
    assert!(h.notifications.for_user(muted).is_empty());
}

#[tokio::test]
async fn test_double_publish_creates_two_rows() {
    let h = Harness::new();
    let workspace = Uuid::new_v4();
    let user = Uuid::new_v4();
    h.member(workspace, user, &[NotificationType::LogCreated], None);

    let event = log_created(workspace, Uuid::new_v4());
    h.producer.publish(event.clone()).await.unwrap();
    h.producer.publish(event).await.unwrap();
    h.drain().await;

    assert_eq!(h.notifications.for_user(user).len(), 2);
}

#[tokio::test]
async fn test_gone_subscription_is_pruned() {
    let h = Harness::new();
    let workspace = Uuid::new_v4();
    let user = Uuid::new_v4();
    h.member(workspace, user, &[NotificationType::LogCreated], None);
    h.subscribe(user, "https://push.example.com/live").await;
    let gone = h.subscribe(user, "https://push.example.com/gone").await;
    h.transport.mark_gone("https://push.example.com/gone");

    h.producer.publish(log_created(workspace, Uuid::new_v4())).await.unwrap();
    h.drain().await;

    assert_eq!(h.queue.completed().len(), 1);
    assert_eq!(h.notifications.for_user(user).len(), 1);

    let remaining = h.subscriptions.find_by_user_id(user).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining.iter().all(|s| s.id != gone));
}

#[tokio::test]
async fn test_persistence_failure_is_redelivered() {
    let h = Harness::new();
    let workspace = Uuid::new_v4();
    let user = Uuid::new_v4();
    h.member(workspace, user, &[NotificationType::LogCreated], None);
    h.subscribe(user, "https://push.example.com/u").await;

    h.producer.publish(log_created(workspace, Uuid::new_v4())).await.unwrap();

    h.notifications.set_failing(true);
    assert_eq!(h.consumer.run_once().await.unwrap(), 1);

    // Nothing was delivered before persistence succeeded.
    assert!(h.transport.attempts().is_empty());
    let pending = h.queue.ready_jobs();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt, 2);

    h.notifications.set_failing(false);
    h.drain().await;

    assert_eq!(h.notifications.for_user(user).len(), 1);
    assert_eq!(h.transport.attempts().len(), 1);
    assert_eq!(h.queue.completed().len(), 1);
}

#[tokio::test]
async fn test_settings_failure_is_redelivered() {
    let h = Harness::new();
    let workspace = Uuid::new_v4();
    h.member(workspace, Uuid::new_v4(), &[NotificationType::LogCreated], None);
    h.settings.set_failing(true);

    h.producer.publish(log_created(workspace, Uuid::new_v4())).await.unwrap();
    h.consumer.run_once().await.unwrap();

    assert!(h.notifications.is_empty());
    assert_eq!(h.queue.ready_len(), 1);
}

#[tokio::test]
async fn test_webhook_outage_still_persists() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&mock_server)
        .await;

    let h = Harness::new();
    let workspace = Uuid::new_v4();
    let user = Uuid::new_v4();
    let hook = format!("{}/services/T000/B000", mock_server.uri());
    h.member(workspace, user, &[NotificationType::LogCreated], Some(hook.as_str()));

    h.producer.publish(log_created(workspace, Uuid::new_v4())).await.unwrap();
    h.drain().await;

    assert_eq!(h.notifications.for_user(user).len(), 1);
    assert_eq!(h.queue.completed().len(), 1);
}

#[tokio::test]
async fn test_unread_flag_invalidated_for_recipients() {
    let h = Harness::new();
    let workspace = Uuid::new_v4();
    let user = Uuid::new_v4();
    h.member(workspace, user, &[NotificationType::LogCreated], None);
    h.cache.set(&unread_key(user), "0", UNREAD_FLAG_TTL).await.unwrap();

    h.producer.publish(log_created(workspace, Uuid::new_v4())).await.unwrap();
    h.drain().await;

    assert!(!h.cache.contains(&unread_key(user)));
}
