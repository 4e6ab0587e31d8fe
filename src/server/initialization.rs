// src/server/initialization.rs

//! Handles the complete router initialization: catalogue load, cache
//! snapshot, state construction, and the listening socket.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::catalogue::VariableCatalogue;
use crate::core::state::RouterState;
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Initializes all router components before the main loop starts.
pub async fn setup(config: Config) -> Result<ServerContext> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let catalogue = VariableCatalogue::from_file(&config.psx.variables)
        .with_context(|| format!("loading catalogue {}", config.psx.variables.display()))?;
    info!(
        "Loaded {} variable definitions from {}",
        catalogue.len(),
        config.psx.variables.display()
    );

    let cache_file = config.psx.cache_file.clone();
    let listen_port = config.listen.port;
    let default_upstream = config.default_upstream().clone();
    info!(
        "Default upstream is {} ({}:{})",
        default_upstream.name, default_upstream.host, default_upstream.port
    );

    let init = RouterState::initialize(config, catalogue)?;
    let state = init.state.clone();
    info!("Router state initialized. UUID {}", state.frdp.uuid);

    if let Some(path) = &cache_file {
        let mut cache = state.cache.lock().await;
        if let Err(e) = cache.read_from_file(path) {
            warn!("Could not read cache snapshot {}: {e}", path.display());
        }
    }

    let listener = TcpListener::bind(("0.0.0.0", listen_port))
        .await
        .with_context(|| format!("binding listen port {listen_port}"))?;
    info!("Router listening on port {listen_port}");

    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        traffic_log_rx: init.traffic_log_rx,
        upstream_reconfigure_rx: Some(init.upstream_reconfigure_rx),
    })
}
