//! VPS payment-reconciliation server
//!
//! Watches the token ledger, reconciles transfers against VPS orders,
//! recharges and withdrawals, and exposes a small live status surface.

mod api;
mod config;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use config::{ConfigLoader, get_database_url};
use server::{build_router, run_server};
use shutdown::broadcast_shutdown;
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vpspay_core::Manager;
use vpspay_core::framework::DatabaseProcessor;
use vpspay_core::provisioning::HttpProvisioner;
use vpspay_core::store::PgRecordStore;

/// VPS payment reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "vpspay-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./vpspay-config.toml")]
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
    init_tracing();

    let args = Args::parse();

    tracing::info!("Starting vpspay-server v{}", env!("CARGO_PKG_VERSION"));

    let loaded_config = ConfigLoader::new(&args.config, args.listen)
        .load()
        .map_err(|e| {
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
        .max_connections(10)
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

    let provisioner = HttpProvisioner::new(&loaded_config.engine.provisioner)?;
    let manager = Manager::connect(loaded_config.engine).await.map_err(|e| {
        tracing::error!("Failed to connect to the ledger: {}", e);
        e
    })?;
    match manager.chain_height().await {
        Ok(height) => tracing::info!(height, "Ledger head"),
        Err(e) => tracing::warn!(error = %e, "Could not read ledger head"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store = Arc::new(PgRecordStore::new(DatabaseProcessor {
        pool: db_pool.clone(),
    }));
    let tasks = manager
        .start(store, Arc::new(provisioner), shutdown_rx.clone())
        .await?;

    let state = AppState::new(manager.bus().clone(), shutdown_rx);
    let router = build_router(state);

    tracing::info!("Starting HTTP server on {}", loaded_config.listen);
    let result = run_server(router, loaded_config.listen, broadcast_shutdown(shutdown_tx)).await;

    tracing::info!("Waiting for engine tasks to stop...");
    tasks.join().await;

    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
