// src/server/context.rs

use crate::core::state::{RouterState, TrafficEntry};
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Holds everything the accept loop and the spawner need.
pub struct ServerContext {
    pub state: Arc<RouterState>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<()>>,
    /// Consumed by the traffic-log writer task, if enabled.
    pub traffic_log_rx: Option<mpsc::Receiver<TrafficEntry>>,
    /// Consumed by the upstream supervisor.
    pub upstream_reconfigure_rx: Option<broadcast::Receiver<()>>,
}
