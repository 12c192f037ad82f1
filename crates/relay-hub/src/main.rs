mod api;
mod config;
mod events;
mod logging;
mod sweeper;

use crate::api::AppState;
use crate::config::Database;
use relay_core::{Coordinator, MemoryStore, RelayStore, SystemClock};
use relay_storage::{SqliteStore, StorageError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = match config::load_config() {
        Ok(value) => value,
        Err(err) => {
            eprintln!("config_error: {err}");
            std::process::exit(2);
        }
    };
    let _log_guard = logging::init_logging(&config);

    let store = match open_store(&config.database) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "store_open_failed", database = %config.database, error = %err);
            return;
        }
    };
    if !config.addr.ip().is_loopback() {
        warn!(event = "public_listen", addr = %config.addr);
    }

    let coordinator = Arc::new(Coordinator::new(
        store,
        Arc::new(SystemClock),
        config.coordinator.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = sweeper::spawn_timeout_sweeper(
        coordinator.clone(),
        config.sweep_interval,
        shutdown_rx.clone(),
    );

    let app = api::router(AppState::new(coordinator, &config.api_key));
    let listener = match tokio::net::TcpListener::bind(config.addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "relay_error", addr = %config.addr, error = %err);
            return;
        }
    };

    info!(
        event = "relay_start",
        addr = %config.addr,
        database = %config.database,
        pending_deadline_secs = config.coordinator.deadlines.pending.as_secs(),
        running_deadline_secs = config.coordinator.deadlines.running.as_secs()
    );

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
        let _ = shutdown_tx.send(true);
    });
    let mut server_shutdown = shutdown_rx;
    let shutdown = async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "relay_error", error = %err);
    }
    let _ = sweeper.await;
    info!(event = "relay_stop");
}

fn open_store(database: &Database) -> Result<Arc<dyn RelayStore>, StorageError> {
    match database {
        Database::Memory => Ok(Arc::new(MemoryStore::new())),
        Database::File(path) => Ok(Arc::new(SqliteStore::open(path)?)),
    }
}
