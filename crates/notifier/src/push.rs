//! Browser push channel.
//!
//! Payloads are encrypted per subscription (`aes128gcm`) and signed with the
//! process-wide VAPID key. A rejection by the push service never fails the
//! whole send: endpoints reported gone are returned for pruning, everything
//! else is counted as transient.

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use web_push::{
    ContentEncoding, IsahcWebPushClient, PartialVapidSignatureBuilder, SubscriptionInfo,
    VapidSignatureBuilder, WebPushClient, WebPushError, WebPushMessageBuilder,
};

use tally_common::config::VapidConfig;
use tally_common::error::AppError;
use tally_common::types::PushSubscription;
use tally_engine::notifications::NotificationContent;
use tally_engine::subscriptions::SubscriptionStore;

/// JSON body shown by the service worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl PushPayload {
    pub fn from_content(content: &NotificationContent) -> Self {
        Self {
            title: content.title.clone(),
            body: content.body.clone(),
            icon: None,
            badge: None,
            data: content.data.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    /// The endpoint no longer exists; the subscription should be removed.
    #[error("Subscription gone: {0}")]
    Permanent(String),

    #[error("Push delivery failed: {0}")]
    Transient(String),
}

impl From<WebPushError> for PushError {
    fn from(e: WebPushError) -> Self {
        match e {
            WebPushError::EndpointNotValid { .. } | WebPushError::EndpointNotFound { .. } => {
                PushError::Permanent(e.to_string())
            }
            other => PushError::Transient(other.to_string()),
        }
    }
}

/// Delivers one encrypted payload to one subscription.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError>;
}

/// [`PushTransport`] backed by the `web-push` crate.
pub struct WebPushTransport {
    client: IsahcWebPushClient,
    signer: PartialVapidSignatureBuilder,
    contact: String,
}

impl WebPushTransport {
    /// Load the VAPID private key (PEM) named in `config`.
    pub fn from_config(config: &VapidConfig) -> Result<Self, AppError> {
        let pem = File::open(&config.private_key_path).map_err(|e| {
            AppError::Config(format!(
                "cannot open VAPID key {}: {}",
                config.private_key_path, e
            ))
        })?;
        let signer = VapidSignatureBuilder::from_pem_no_sub(pem)
            .map_err(|e| AppError::Config(format!("invalid VAPID key: {}", e)))?;
        let client = IsahcWebPushClient::new()
            .map_err(|e| AppError::Internal(format!("push client init failed: {}", e)))?;

        Ok(Self {
            client,
            signer,
            contact: config.contact.clone(),
        })
    }
}

#[async_trait]
impl PushTransport for WebPushTransport {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
        let info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.p256dh,
            &subscription.auth,
        );

        let mut sig = self.signer.clone().add_sub_info(&info);
        sig.add_claim("sub", format!("mailto:{}", self.contact));
        let signature = sig.build()?;

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);
        let message = builder.build()?;

        self.client.send(message).await?;
        Ok(())
    }
}

/// Upper bound on a single push service round trip.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of [`PushChannel::send_to_user`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub sent_count: usize,
    /// Subscriptions whose endpoint is permanently gone.
    pub failed_subscription_ids: Vec<Uuid>,
    pub transient_failures: usize,
}

pub struct PushChannel {
    subscriptions: Arc<dyn SubscriptionStore>,
    transport: Arc<dyn PushTransport>,
    public_key: String,
    send_timeout: Duration,
}

impl PushChannel {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        transport: Arc<dyn PushTransport>,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            subscriptions,
            transport,
            public_key: public_key.into(),
            send_timeout: SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// VAPID public key handed to browsers when they subscribe.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Push `payload` to every subscription of `user_id`, concurrently.
    pub async fn send_to_user(
        &self,
        user_id: Uuid,
        payload: &PushPayload,
    ) -> Result<PushReport, AppError> {
        let subscriptions = self.subscriptions.find_by_user_id(user_id).await?;
        if subscriptions.is_empty() {
            return Ok(PushReport::default());
        }

        let body = serde_json::to_vec(payload)
            .map_err(|e| AppError::Internal(format!("failed to encode push payload: {}", e)))?;

        // A stalled push service counts as a transient failure for that endpoint.
        let results = join_all(subscriptions.iter().map(|sub| async {
            let result = tokio::time::timeout(self.send_timeout, self.transport.send(sub, &body))
                .await
                .unwrap_or_else(|_| {
                    Err(PushError::Transient(format!(
                        "push send timed out after {:?}",
                        self.send_timeout
                    )))
                });
            (sub.id, result)
        }))
        .await;

        let mut report = PushReport::default();
        for (subscription_id, result) in results {
            match result {
                Ok(()) => report.sent_count += 1,
                Err(PushError::Permanent(reason)) => {
                    tracing::info!(
                        user_id = %user_id,
                        subscription_id = %subscription_id,
                        reason = %reason,
                        "Push subscription gone"
                    );
                    report.failed_subscription_ids.push(subscription_id);
                }
                Err(PushError::Transient(reason)) => {
                    tracing::warn!(
                        user_id = %user_id,
                        subscription_id = %subscription_id,
                        reason = %reason,
                        "Push delivery failed"
                    );
                    report.transient_failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// Remove subscriptions reported as gone.
    pub async fn prune(&self, subscription_ids: &[Uuid]) -> Result<u64, AppError> {
        if subscription_ids.is_empty() {
            return Ok(0);
        }
        self.subscriptions.delete_by_ids(subscription_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_engine::memory::MemorySubscriptionStore;
    use tally_engine::subscriptions::RegisterSubscriptionParams;

    /// Fails every endpoint containing "gone" permanently and "flaky" transiently.
    struct EndpointTransport;

    #[async_trait]
    impl PushTransport for EndpointTransport {
        async fn send(&self, sub: &PushSubscription, _payload: &[u8]) -> Result<(), PushError> {
            if sub.endpoint.contains("gone") {
                Err(PushError::Permanent("410 Gone".to_string()))
            } else if sub.endpoint.contains("flaky") {
                Err(PushError::Transient("503".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn payload() -> PushPayload {
        PushPayload {
            title: "t".to_string(),
            body: "b".to_string(),
            icon: None,
            badge: None,
            data: None,
        }
    }

    async fn subscribe(store: &MemorySubscriptionStore, user: Uuid, endpoint: &str) -> Uuid {
        let params = RegisterSubscriptionParams {
            endpoint: endpoint.to_string(),
            p256dh: "key".to_string(),
            auth: "auth".to_string(),
        };
        store.upsert(user, &params).await.unwrap().id
    }

    #[tokio::test]
    async fn test_no_subscriptions_short_circuits() {
        let store = Arc::new(MemorySubscriptionStore::new());
        let channel = PushChannel::new(store, Arc::new(EndpointTransport), "pub");

        let report = channel.send_to_user(Uuid::new_v4(), &payload()).await.unwrap();
        assert_eq!(report, PushReport::default());
        assert_eq!(channel.public_key(), "pub");
    }

    #[tokio::test]
    async fn test_classifies_failures() {
        let store = Arc::new(MemorySubscriptionStore::new());
        let user = Uuid::new_v4();
        subscribe(&store, user, "https://push.example.com/ok").await;
        let gone = subscribe(&store, user, "https://push.example.com/gone").await;
        subscribe(&store, user, "https://push.example.com/flaky").await;

        let channel = PushChannel::new(store.clone(), Arc::new(EndpointTransport), "pub");
        let report = channel.send_to_user(user, &payload()).await.unwrap();

        assert_eq!(report.sent_count, 1);
        assert_eq!(report.failed_subscription_ids, vec![gone]);
        assert_eq!(report.transient_failures, 1);

        assert_eq!(channel.prune(&report.failed_subscription_ids).await.unwrap(), 1);
        assert_eq!(store.len(), 2);
    }

    /// Never answers for endpoints containing "stall".
    struct StallingTransport;

    #[async_trait]
    impl PushTransport for StallingTransport {
        async fn send(&self, sub: &PushSubscription, _payload: &[u8]) -> Result<(), PushError> {
            if sub.endpoint.contains("stall") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_is_transient() {
        let store = Arc::new(MemorySubscriptionStore::new());
        let user = Uuid::new_v4();
        subscribe(&store, user, "https://push.example.com/ok").await;
        subscribe(&store, user, "https://push.example.com/stall").await;

        let channel = PushChannel::new(store.clone(), Arc::new(StallingTransport), "pub")
            .with_send_timeout(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let report = channel.send_to_user(user, &payload()).await.unwrap();

        assert_eq!(report.sent_count, 1);
        assert_eq!(report.transient_failures, 1);
        assert!(report.failed_subscription_ids.is_empty());
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_payload_omits_empty_fields() {
        let json = serde_json::to_value(payload()).unwrap();
        assert_eq!(json, serde_json::json!({ "title": "t", "body": "b" }));
    }
}
