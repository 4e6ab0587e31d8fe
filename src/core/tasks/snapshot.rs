// src/core/tasks/snapshot.rs

//! Periodic cache snapshot to disk, so a freshly restarted router can
//! serve welcomes before its upstream connects.

use crate::core::state::RouterState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

pub struct CacheSnapshotTask {
    state: Arc<RouterState>,
    path: PathBuf,
}

impl CacheSnapshotTask {
    pub fn new(state: Arc<RouterState>, path: PathBuf) -> Self {
        Self { state, path }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.save().await;
                    info!("Final cache snapshot written.");
                    return;
                }
                _ = interval.tick() => self.save().await,
            }
        }
    }

    async fn save(&self) {
        let cache = self.state.cache.lock().await;
        if let Err(e) = cache.write_to_file(&self.path) {
            warn!("Cache snapshot to {} failed: {e}", self.path.display());
        }
    }
}
