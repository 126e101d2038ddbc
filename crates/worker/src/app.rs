//! Service wiring shared by the binary and the integration tests.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use tally_common::config::AppConfig;
use tally_engine::cache::{CacheClient, RedisCache};
use tally_engine::cleanup::CleanupScheduler;
use tally_engine::inbox::InboxService;
use tally_engine::notifications::PgNotificationStore;
use tally_engine::producer::EventProducer;
use tally_engine::settings::PgSettingsProvider;
use tally_engine::subscriptions::PgSubscriptionStore;
use tally_notifier::{NotificationWorker, PushChannel, PushTransport, WebhookChannel};
use tally_queue::{ConsumerConfig, JobQueue, QueueConsumer, RedisStreamQueue, StreamQueueConfig};

/// Everything the process runs, built from one configuration.
pub struct App {
    pub producer: EventProducer,
    pub inbox: InboxService,
    pub consumer: QueueConsumer<NotificationWorker>,
    pub cleanup: CleanupScheduler,
    pub cache: Arc<RedisCache>,
}

impl App {
    /// Wire stores, channels and the queue. Connects the cache and makes sure
    /// the consumer group exists.
    pub async fn build(
        config: &AppConfig,
        pool: PgPool,
        redis: ConnectionManager,
        redis_client: redis::Client,
        transport: Arc<dyn PushTransport>,
        stream: StreamQueueConfig,
    ) -> anyhow::Result<Self> {
        let stream = stream.with_visibility_timeout(Duration::from_millis(
            config.queue_visibility_timeout_ms,
        ));
        let stream_queue = RedisStreamQueue::new(redis, stream);
        stream_queue.ensure_consumer_group().await?;
        let queue: Arc<dyn JobQueue> = Arc::new(stream_queue);

        let notifications = Arc::new(PgNotificationStore::new(pool.clone()));
        let subscriptions = Arc::new(PgSubscriptionStore::new(pool.clone()));
        let settings = Arc::new(PgSettingsProvider::new(pool));

        let cache = Arc::new(RedisCache::new(redis_client));
        cache.connect().await?;

        let push = Arc::new(PushChannel::new(
            subscriptions.clone(),
            transport,
            config.vapid.public_key.clone(),
        ));
        let worker = NotificationWorker::new(
            settings,
            notifications.clone(),
            cache.clone(),
            push,
            WebhookChannel::new()?,
        )
        .with_exclude_actor(config.notify_exclude_actor);

        let consumer = QueueConsumer::new(
            queue.clone(),
            Arc::new(worker),
            ConsumerConfig {
                concurrency: config.worker_concurrency,
                max_deliveries: config.queue_max_deliveries,
                ..Default::default()
            },
        );

        let inbox = InboxService::new(
            notifications.clone(),
            subscriptions,
            cache.clone(),
            config.vapid.public_key.clone(),
        );

        Ok(Self {
            producer: EventProducer::new(queue),
            inbox,
            consumer,
            cleanup: CleanupScheduler::new(notifications),
            cache,
        })
    }
}
