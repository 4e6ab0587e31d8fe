// src/server/spawner.rs

//! Spawns all of the router's long-running background tasks.

use super::context::ServerContext;
use super::rest_api;
use crate::core::router::Engine;
use crate::core::tasks::frdp_ticker::FrdpTicker;
use crate::core::tasks::snapshot::CacheSnapshotTask;
use crate::core::tasks::status::StatusTicker;
use crate::core::tasks::traffic_log::TrafficLogWriter;
use crate::core::upstream::UpstreamWorker;
use anyhow::Result;
use tracing::info;

/// Spawns all background tasks into the context's JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let engine = Engine::new(state.clone());

    // --- Upstream supervisor ---
    let reconfigure_rx = ctx
        .upstream_reconfigure_rx
        .take()
        .expect("upstream reconfigure receiver present at startup");
    let upstream_worker = UpstreamWorker::new(engine.clone(), reconfigure_rx);
    let shutdown_rx_upstream = shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        upstream_worker.run(shutdown_rx_upstream).await;
        Ok(())
    });

    // --- FRDP ticker ---
    let ticker = FrdpTicker::new(engine.clone());
    let shutdown_rx_frdp = shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        ticker.run(shutdown_rx_frdp).await;
        Ok(())
    });

    // --- Status display ---
    let status = StatusTicker::new(state.clone());
    let shutdown_rx_status = shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        status.run(shutdown_rx_status).await;
        Ok(())
    });

    // --- Traffic log writer ---
    if let Some(rx) = ctx.traffic_log_rx.take() {
        let writer = TrafficLogWriter::new(state.clone(), rx).await?;
        let shutdown_rx_log = shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            writer.run(shutdown_rx_log).await;
            Ok(())
        });
    }

    // --- Cache snapshots ---
    let cache_file = state.config.lock().await.psx.cache_file.clone();
    if let Some(path) = cache_file {
        let snapshot = CacheSnapshotTask::new(state.clone(), path);
        let shutdown_rx_snapshot = shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            snapshot.run(shutdown_rx_snapshot).await;
            Ok(())
        });
    }

    // --- REST API ---
    let rest_port = state.config.lock().await.listen.rest_api_port;
    if let Some(port) = rest_port {
        let api_engine = engine.clone();
        let shutdown_rx_api = shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            rest_api::run_rest_api(api_engine, port, shutdown_rx_api).await;
            Ok(())
        });
    } else {
        info!("REST API is disabled in the configuration.");
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
