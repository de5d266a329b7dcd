// Main entry point for the phishwatch API server and workers

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use phishwatch_core::kernel::jobs::{
    JobWorkerConfig, LocalTaskQueue, PostgresJobStore, ScreenshotSweep, Worker, WorkerPool,
};
use phishwatch_core::kernel::{
    FanoutTransport, KeyValueStore, MemoryKeyValueStore, NatsTransport, NotificationTransport,
    OpenAiAnalyzer, RedisKeyValueStore, ServerKernel, StreamHub, UrlscanScanner,
};
use phishwatch_core::server::{build_app, AppState};
use phishwatch_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use urlscan_client::UrlscanClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,phishwatch_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting phishwatch");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let kv: Arc<dyn KeyValueStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisKeyValueStore::connect(url).await?),
        None => {
            tracing::warn!("REDIS_URL not set, dedup locks and status cache are process-local");
            Arc::new(MemoryKeyValueStore::new())
        }
    };

    let stream_hub = StreamHub::new();
    let mut transports: Vec<Arc<dyn NotificationTransport>> = vec![Arc::new(stream_hub.clone())];
    if let Some(url) = &config.nats_url {
        transports.push(Arc::new(NatsTransport::connect(url).await?));
    }

    let store = Arc::new(PostgresJobStore::new(pool.clone()));
    let (task_queue, tasks) = LocalTaskQueue::new();

    let kernel = Arc::new(ServerKernel::new(
        store.clone(),
        store,
        kv,
        Arc::new(FanoutTransport::new(transports)),
        Arc::new(OpenAiAnalyzer::new(
            config.openai_api_key.clone(),
            config.openai_model.clone(),
        )),
        Arc::new(UrlscanScanner::new(UrlscanClient::new(
            config.urlscan_api_key.clone(),
        ))),
        Arc::new(task_queue),
        config.orchestrator.clone(),
    ));

    // Background work
    let shutdown = CancellationToken::new();
    let pool_config = JobWorkerConfig::default().with_concurrency(config.worker_concurrency);
    let workers = tokio::spawn(
        WorkerPool::new(Worker::new(kernel.clone()), pool_config).run(tasks, shutdown.clone()),
    );
    let sweep = tokio::spawn(
        ScreenshotSweep::new(kernel.clone()).run(config.screenshot_sweep_interval, shutdown.clone()),
    );

    let app = build_app(AppState::new(kernel, stream_hub, pool));

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        server_shutdown.cancel();
    })
    .await
    .context("Server error")?;

    shutdown.cancel();
    workers.await.context("Worker pool panicked")??;
    sweep.await.context("Screenshot sweep panicked")?;
    tracing::info!("Shutdown complete");

    Ok(())
}
