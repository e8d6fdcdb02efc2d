//! lastseen relay server
//!
//! Relays device telemetry from the message bus into the device presence
//! table and keeps the table's liveness marker fresh.

mod config;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use config::{ConfigLoader, get_bus_url, get_database_options};
use lastseen_core::bus::JetStreamBus;
use lastseen_core::processors::Supervisor;
use lastseen_core::store::{PgDeviceTable, PresenceStore};
use server::{build_router, run_server};
use shutdown::spawn_signal_forwarder;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DB_MAX_CONNECTIONS: u32 = 10;
const BUS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// lastseen - device presence relay
#[derive(Parser, Debug)]
#[command(name = "lastseen-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "LASTSEEN_CONFIG", default_value = "./lastseen.toml")]
    config: PathBuf,

    /// Override the listen address of the health endpoints (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LASTSEEN_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!("Starting lastseen-server v{}", env!("CARGO_PKG_VERSION"));

    let loaded_config = ConfigLoader::new(&args.config, args.listen)
        .load()
        .map_err(|e| {
            tracing::error!("Failed to load configuration: {}", e);
            e
        })?;
    let listen_addr = loaded_config.listen;
    tracing::info!(
        channels = loaded_config.supervisor.channels.len(),
        "Configuration loaded from {:?}",
        args.config
    );

    let bus_url = get_bus_url().map_err(|e| {
        tracing::error!("{}", e);
        e
    })?;
    let db_options = get_database_options().map_err(|e| {
        tracing::error!("{}", e);
        e
    })?;

    tracing::info!("Connecting to message bus...");
    let bus = JetStreamBus::connect(&bus_url, BUS_CONNECT_TIMEOUT)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to message bus: {}", e);
            e
        })?;

    tracing::info!("Connecting to database...");
    let table = PgDeviceTable::connect(db_options, DB_MAX_CONNECTIONS)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    let db_pool = table.pool().clone();

    let store = Arc::new(PresenceStore::new(table));
    let supervisor = Supervisor::new(Arc::new(bus), store.clone(), loaded_config.supervisor);
    let state = AppState::new(store, supervisor.heartbeat_status());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = spawn_signal_forwarder(shutdown_tx.clone());

    tracing::info!("Starting HTTP server on {}", listen_addr);
    let server = tokio::spawn(run_server(
        build_router(state),
        listen_addr,
        shutdown_rx.clone(),
    ));

    let result = supervisor.run(shutdown_rx).await;
    if let Err(e) = &result {
        tracing::error!("Relay stopped: {}", e);
    }

    // Stop the HTTP server whatever ended the relay.
    shutdown_tx.send_replace(true);
    drop(shutdown_tx);
    signal_task.abort();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("HTTP server failed: {}", e),
        Err(e) => tracing::error!("HTTP server task failed: {}", e),
    }

    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,async_nats=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
