// Main entry point for the self-service membership worker

use anyhow::{Context, Result};
use selfservice_core::domains::membership::service::MembershipApplicationService;
use selfservice_core::kernel::consumer::MessageConsumer;
use selfservice_core::kernel::outbox::{OutboxRelay, PgOutboxStore};
use selfservice_core::kernel::persistence::PgDatabase;
use selfservice_core::kernel::producer::NatsProducer;
use selfservice_core::kernel::scheduled_tasks::start_scheduler;
use selfservice_core::kernel::SystemClock;
use selfservice_core::server::{build_registry, consumed_topics};
use selfservice_core::Config;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,selfservice_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting self-service membership worker");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Connect to the broker
    let nats = async_nats::connect(config.nats_url.as_str())
        .await
        .context("Failed to connect to NATS")?;
    tracing::info!(url = %config.nats_url, "Broker connected");

    // Build the dependency graph
    let producer = Arc::new(NatsProducer::new(nats.clone()));
    let database = PgDatabase::new(pool.clone());
    let service = Arc::new(MembershipApplicationService::new(
        database,
        Arc::new(SystemClock),
    ));

    // Outbox relay: drains committed events to the broker
    let relay = OutboxRelay::new(PgOutboxStore::new(pool.clone()), producer);
    tokio::spawn(relay.run());

    // Consumer: feeds broker messages to the policies
    let registry = Arc::new(build_registry(service.clone()));
    let consumer = MessageConsumer::new(nats, registry, consumed_topics());
    tokio::spawn(async move {
        if let Err(err) = consumer.run().await {
            tracing::error!(error = %err, "message consumer stopped");
        }
    });

    // Expiry sweeper
    let _scheduler = start_scheduler(service).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    Ok(())
}
