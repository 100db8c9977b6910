//! Pickup Point Event Relay Server
//!
//! Runs the outbox relay and the DLQ worker against Postgres and a Kafka
//! REST proxy, and serves health endpoints.

mod config;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use config::{ConfigLoader, LogFormat, LoggingConfig, get_database_url};
use pickup_core::broker::RestProxyProducer;
use pickup_core::clock::{Clock, SystemClock};
use pickup_core::config::SettingsStore;
use pickup_core::processors::{DlqWorker, OutboxRelay};
use pickup_core::store::PgStore;
use server::{build_router, run_server};
use shutdown::{spawn_config_reload_handler, spawn_shutdown_listener};
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Pickup point event relay - publishes order events from the outbox
#[derive(Parser, Debug)]
#[command(name = "pickup-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "PICKUP_CONFIG", default_value = "./pickup-config.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration before tracing so the log format can come from it
    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.listen));
    let loaded = config_loader.load();
    init_tracing(
        loaded
            .as_ref()
            .map(|c| c.logging.clone())
            .unwrap_or_default(),
    );
    tracing::info!("Starting pickup-server v{}", env!("CARGO_PKG_VERSION"));
    let loaded = loaded.map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(loaded.max_connections)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    let store = PgStore::new(db_pool.clone());
    let producer = Arc::new(RestProxyProducer::new(
        &loaded.broker.rest_proxy_url,
        &loaded.broker.topic,
        Duration::from_secs(loaded.broker.timeout_secs),
    )?);
    tracing::info!(endpoint = %producer.endpoint(), "Publishing to Kafka REST proxy");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone())?;

    let relay_settings = SettingsStore::new(loaded.relay.clone());
    let dlq_settings = SettingsStore::new(loaded.dlq.clone());
    spawn_config_reload_handler(
        config_loader,
        relay_settings.clone(),
        dlq_settings.clone(),
        shutdown.clone(),
    )?;

    let relay = OutboxRelay::new(store.clone(), Arc::clone(&producer), Arc::clone(&clock));
    let relay_handle = tokio::spawn(relay.run(shutdown.clone(), relay_settings));

    let dlq_worker = DlqWorker::new(store.clone(), Arc::clone(&producer), clock);
    let dlq_handle = tokio::spawn(dlq_worker.run(shutdown.clone(), dlq_settings));

    let router = build_router(AppState::new(store));
    tracing::info!("Starting HTTP server on {}", loaded.listen);
    let result = run_server(router, loaded.listen, shutdown.clone()).await;

    // The server may also stop on its own (bind failure)
    shutdown.cancel();
    if let Err(e) = relay_handle.await {
        tracing::error!("OutboxRelay task failed: {}", e);
    }
    if let Err(e) = dlq_handle.await {
        tracing::error!("DlqWorker task failed: {}", e);
    }

    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter, which wins over the default.
fn init_tracing(logging: LoggingConfig) {
    const DEFAULT_FILTER: &str = "info,sqlx=warn";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(logging.filter.as_deref().unwrap_or(DEFAULT_FILTER))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    });

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
