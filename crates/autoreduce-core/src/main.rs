// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Autoreduce Queue Processor
//!
//! Consumes lifecycle messages and keeps reduction runs up to date.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use autoreduce_core::channel::{MessageChannel, MessageSource};
use autoreduce_core::config::Config;
use autoreduce_core::consumer::{QueueConsumer, QueueConsumerConfig};
use autoreduce_core::handlers::HandlerState;
use autoreduce_core::migrations;
use autoreduce_core::persistence::{Directory, PostgresPersistence, RunStore, SqlitePersistence};
use autoreduce_core::script::FsScriptResolver;

/// One backend serving every persistence and queue role.
struct Backend {
    directory: Arc<dyn Directory>,
    store: Arc<dyn RunStore>,
    channel: Arc<dyn MessageChannel>,
    source: Arc<dyn MessageSource>,
}

impl Backend {
    fn new<T>(persistence: T) -> Self
    where
        T: Directory + RunStore + MessageChannel + MessageSource + 'static,
    {
        let persistence = Arc::new(persistence);
        Self {
            directory: persistence.clone(),
            store: persistence.clone(),
            channel: persistence.clone(),
            source: persistence,
        }
    }
}

async fn connect(database_url: &str) -> Result<Backend> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        info!(path = %path, "Opening SQLite database");
        let persistence = SqlitePersistence::from_path(path.trim_start_matches("//")).await?;
        return Ok(Backend::new(persistence));
    }

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    info!("Database connection established");

    info!("Running database migrations...");
    migrations::run_postgres(&pool).await?;
    info!("Migrations completed");

    Ok(Backend::new(PostgresPersistence::new(pool)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("autoreduce_core=info".parse()?),
        )
        .init();

    info!("Starting Autoreduce Queue Processor");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        scripts_dir = %config.scripts_dir,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        max_retry_version = config.max_retry_version,
        "Configuration loaded"
    );

    let backend = connect(&config.database_url).await?;

    let state = HandlerState::new(
        backend.directory,
        backend.store,
        Arc::new(FsScriptResolver::new(config.scripts_dir.clone())),
        backend.channel,
    )
    .with_queues(config.queues.clone())
    .with_max_retry_version(config.max_retry_version);

    let consumer = QueueConsumer::new(
        backend.source,
        Arc::new(state),
        QueueConsumerConfig {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
        },
    );
    let shutdown = consumer.shutdown_handle();
    let consumer_handle = tokio::spawn(consumer.run());

    info!("Autoreduce Queue Processor initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.notify_one();
    if let Err(e) = consumer_handle.await {
        error!("Queue consumer task failed: {}", e);
    }

    info!("Shutdown complete");

    Ok(())
}
