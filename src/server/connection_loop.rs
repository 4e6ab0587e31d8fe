// src/server/connection_loop.rs

//! Contains the main accept loop and graceful shutdown.

use super::context::ServerContext;
use crate::connection::ClientHandler;
use crate::core::router::Engine;
use crate::core::state::StatsState;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

// Platform-specific signal handling imports
#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for a shutdown signal. On Unix, SIGINT and SIGTERM; on Windows,
/// Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("Failed to create Ctrl+C stream");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, initiating graceful shutdown."); } } => {},
    }
}

/// The main loop accepting client connections until shutdown.
pub async fn run(mut ctx: ServerContext) {
    let engine = Engine::new(ctx.state.clone());
    let mut client_tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => break,

            // A failed background task takes the router down; a finished
            // one is normal for disabled features.
            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => info!("A background task has completed."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {e:#}. Shutting down."); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        info!("Accepted new connection from: {addr}");
                        StatsState::bump(&ctx.state.stats.total_connections);

                        let (handler, reader) = ClientHandler::new(
                            engine.clone(),
                            socket,
                            addr,
                            ctx.shutdown_tx.subscribe(),
                        );
                        client_tasks.spawn(handler.run(reader));
                    }
                    Err(e) => error!("Failed to accept connection: {e}"),
                }
            },

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A client handler panicked: {e:?}");
                }
            },
        }
    }

    // --- Graceful shutdown sequence ---
    info!("Shutting down. Notifying clients.");
    for entry in ctx.state.clients.iter() {
        entry.value().enqueue("exit");
    }
    // Give writers a moment to flush the exit lines and the traffic log a
    // grace window.
    tokio::time::sleep(Duration::from_millis(500)).await;

    if ctx.shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
    }

    client_tasks.shutdown().await;
    info!("All client connections closed.");

    if tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    }
    info!("Router shutdown complete.");
}
