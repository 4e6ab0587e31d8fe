// src/core/tasks/traffic_log.rs

//! The traffic-log writer task.
//!
//! One line per message with a microsecond timestamp, direction marker
//! (`>` out, `<` in), peer id, and the raw line. Entries arrive over a
//! bounded queue; when the queue fills, the hot path drops entries and
//! counts them instead of stalling.

use crate::core::state::{RouterState, TrafficDirection, TrafficEntry};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

pub struct TrafficLogWriter {
    state: Arc<RouterState>,
    rx: mpsc::Receiver<TrafficEntry>,
    path: PathBuf,
    max_size: u64,
    keep_versions: u32,
    written: u64,
}

impl TrafficLogWriter {
    pub async fn new(
        state: Arc<RouterState>,
        rx: mpsc::Receiver<TrafficEntry>,
    ) -> std::io::Result<Self> {
        let (directory, simulator, max_size, keep_versions) = {
            let config = state.config.lock().await;
            (
                config.log.directory.clone(),
                config.identity.simulator.clone(),
                config.log.traffic_max_size,
                config.log.traffic_keep_versions,
            )
        };
        let path = directory.join(format!("frankenrouter-{simulator}-traffic.psxnet.log"));
        Ok(Self {
            state,
            rx,
            path,
            max_size,
            keep_versions,
            written: 0,
        })
    }

    async fn open(&mut self) -> std::io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(BufWriter::new(file))
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut writer = match self.open().await {
            Ok(writer) => {
                info!("Logging traffic to {}", self.path.display());
                writer
            }
            Err(e) => {
                error!(
                    "Cannot open traffic log {}: {e}. Traffic logging disabled.",
                    self.path.display()
                );
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    // Drain whatever is already queued, then flush.
                    while let Ok(entry) = self.rx.try_recv() {
                        let _ = writer.write_all(format_entry(&entry).as_bytes()).await;
                    }
                    let _ = writer.flush().await;
                    info!("Traffic log flushed.");
                    return;
                }
                entry = self.rx.recv() => {
                    let Some(entry) = entry else { return };
                    let line = format_entry(&entry);
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        warn!("Traffic log write failed: {e}");
                        continue;
                    }
                    self.written += line.len() as u64;
                    if self.max_size > 0 && self.written > self.max_size {
                        let _ = writer.flush().await;
                        drop(writer);
                        self.rotate().await;
                        writer = match self.open().await {
                            Ok(writer) => writer,
                            Err(e) => {
                                error!("Cannot reopen traffic log: {e}. Traffic logging disabled.");
                                return;
                            }
                        };
                    }
                }
            }
        }
    }

    /// Shifts `log` -> `log.1` -> ... -> `log.N`, dropping the oldest.
    async fn rotate(&self) {
        let path = |n: u32| {
            if n == 0 {
                self.path.clone()
            } else {
                self.path.with_extension(format!("log.{n}"))
            }
        };
        let _ = tokio::fs::remove_file(path(self.keep_versions)).await;
        for n in (0..self.keep_versions).rev() {
            let _ = tokio::fs::rename(path(n), path(n + 1)).await;
        }
        info!("Rotated traffic log {}", self.path.display());
    }
}

fn format_entry(entry: &TrafficEntry) -> String {
    let when: DateTime<Local> = entry.when.into();
    let direction = match entry.direction {
        TrafficDirection::In => '<',
        TrafficDirection::Out => '>',
    };
    format!(
        "{} {direction} [{}] {}\n",
        when.format("%Y-%m-%dT%H:%M:%S%.6f"),
        entry.peer,
        entry.line
    )
}
