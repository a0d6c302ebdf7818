// CLI Relay - local gateway with provider failover, blacklisting and health probes

pub mod api;
pub mod availability;
pub mod config;
pub mod db;
pub mod error;
pub mod probe;
pub mod proxy;
pub mod scheduler;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::providers::FileProviderRegistry;
use config::ConfigStore;
use db::{SqliteStore, StateStore};

/// Run the gateway until Ctrl-C.
pub async fn run() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let arg = std::env::args().nth(1);
    let data_dir = config::resolve_data_dir(arg.as_deref());
    let settings = Arc::new(ConfigStore::load_or_create(data_dir.join("config.yaml"))?);

    let registry = Arc::new(FileProviderRegistry::new(data_dir.join("providers")));
    let store: Option<Arc<dyn StateStore>> = match SqliteStore::open(&data_dir.join("relay.db")) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::error!("Failed to initialize database, state will not persist: {}", e);
            None
        }
    };

    let state = api::AppState::new(settings.clone(), registry, store)?;
    state.availability.restore();
    state.probes.restore();
    state.availability.start_recovery_sweep();
    if settings.get().probe.auto_enabled {
        state.probes.set_auto_probe(true).await;
    }

    tracing::info!("Starting API server...");
    let server = api::start_server(state.clone()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    state.probes.set_auto_probe(false).await;
    state.availability.stop_recovery_sweep().await;
    server.stop().await
}
