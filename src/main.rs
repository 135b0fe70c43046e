mod config;
mod dedup;
mod dispatcher;
mod error;
mod event;
mod platform;
mod plugins;
mod queue;
mod receiver;
mod scheduler;
mod server;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, DedupBackend};
use crate::dedup::{DedupStore, Deduplicator, MemoryDedupStore, SqliteDedupStore, Stage};
use crate::dispatcher::Dispatcher;
use crate::platform::slack::SlackSender;
use crate::platform::{LogSender, ResponseSender};
use crate::plugins::{HandlerCatalog, PluginRegistry, PluginRouter};
use crate::queue::MemoryQueue;
use crate::receiver::EventReceiver;
use crate::scheduler::tasks::register_builtin_tasks;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Bind: {}", config.server.bind);
    info!("  Dedup backend: {} (retention {}s)", config.dedup.backend, config.dedup.retention_secs);
    info!("  Queue: capacity {}, max attempts {}", config.queue.capacity, config.queue.max_attempts);
    info!("  Workers: {}", config.dispatch.workers);
    info!("  Plugins configured: {}", config.plugins.len());

    // Dedup: one store, one namespace per stage
    let store: Arc<dyn DedupStore> = match config.dedup.backend {
        DedupBackend::Memory => Arc::new(MemoryDedupStore::new()),
        DedupBackend::Sqlite => Arc::new(SqliteDedupStore::open(
            &config.dedup.database_path,
            config.dedup.busy_timeout(),
        )?),
    };
    let retention = config.dedup.retention();
    let ingress_dedup = Arc::new(Deduplicator::new(store.clone(), Stage::Ingress, retention));
    let dispatch_dedup = Arc::new(Deduplicator::new(store, Stage::Dispatch, retention));

    // Plugins
    let catalog = HandlerCatalog::builtin();
    let registry = Arc::new(
        PluginRegistry::load(&config.plugins, &catalog).context("Invalid plugin configuration")?,
    );
    if registry.is_empty() {
        warn!("No plugins enabled; every event will take the unmatched path");
    } else {
        info!("  Plugins enabled: {}", registry.len());
    }

    let sender: Arc<dyn ResponseSender> = if config.slack.bot_token.is_empty() {
        warn!("No Slack bot token configured; responses will only be logged");
        Arc::new(LogSender)
    } else {
        Arc::new(SlackSender::new(config.slack.clone()))
    };

    let queue = Arc::new(
        MemoryQueue::new(config.queue.capacity, config.queue.max_attempts, config.queue.backoff())
            .with_dead_letter_limit(config.queue.dead_letter_limit),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        dispatch_dedup.clone(),
        PluginRouter::new(registry),
        sender,
        config.dispatch.unmatched,
        config.dispatch.plugin_timeout(),
    ));
    let receiver = Arc::new(EventReceiver::new(
        ingress_dedup.clone(),
        queue.clone(),
        config.server.ack_deadline(),
        config.server.publish_timeout(),
        config.server.dedup_timeout(),
    ));

    let workers = tokio::spawn(worker::run_workers(
        queue.clone(),
        dispatcher.clone(),
        config.dispatch.workers,
    ));

    // Background tasks
    let mut scheduler = Scheduler::new().await?;
    register_builtin_tasks(
        &mut scheduler,
        dispatch_dedup.clone(),
        &config.dedup.sweep_cron,
        queue.clone(),
    )
    .await?;
    scheduler.start().await?;

    let app = server::router(server::AppState {
        receiver,
        dispatcher,
        ingress_dedup,
        dispatch_dedup,
        queue: queue.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;

    info!("Bot is listening on {}", config.server.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain: refuse new publishes, let workers finish what is buffered. Redeliveries
    // still waiting out their backoff are dropped.
    queue.close();
    if let Err(e) = workers.await {
        warn!(error = %e, "worker pool ended abnormally");
    }
    scheduler.shutdown().await;

    let stats = queue.stats();
    info!(
        published = stats.published,
        acked = stats.acked,
        dead_lettered = stats.dead_lettered,
        "Shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
