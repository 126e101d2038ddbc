use std::sync::Arc;

use tokio::sync::watch;

use tally_common::config::AppConfig;
use tally_common::{db, redis_pool};
use tally_engine::cache::CacheClient;
use tally_notifier::WebPushTransport;
use tally_queue::StreamQueueConfig;
use tally_worker::app::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tally_worker=info,tally_notifier=info,tally_engine=info,tally_queue=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Tally notification worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;

    // Run migrations
    db::run_migrations(&pool).await?;

    // Connect to Redis
    let redis = redis_pool::create_redis_pool(&config.redis).await?;
    let redis_client = redis_pool::create_redis_client(&config.redis)?;

    let transport = Arc::new(WebPushTransport::from_config(&config.vapid)?);

    let app = App::build(
        &config,
        pool,
        redis,
        redis_client,
        transport,
        StreamQueueConfig::default(),
    )
    .await?;

    app.cleanup.start();

    // Run with graceful shutdown on Ctrl+C
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal, draining in-flight jobs...");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(
        concurrency = config.worker_concurrency,
        "Consuming notification jobs"
    );
    let result = app.consumer.run(shutdown_rx).await;

    app.cleanup.stop();
    if let Err(e) = app.cache.disconnect().await {
        tracing::warn!(error = %e, "Cache disconnect failed");
    }

    if let Err(e) = result {
        tracing::error!(error = %e, "Queue consumer exited with error");
        return Err(e.into());
    }

    tracing::info!("Tally notification worker stopped.");
    Ok(())
}
