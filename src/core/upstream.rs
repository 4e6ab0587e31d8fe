// src/core/upstream.rs

//! The upstream session: a single outbound-initiated connection with an
//! infinite reconnect loop, authentication, and connection-state
//! broadcast.
//!
//! Lifecycle: DISCONNECTED -> CONNECTING -> AUTHING -> LIVE. Backoff
//! starts at 1 s, doubles to a 30 s cap, and resets on a successful LIVE
//! entry. On loss of a live connection every downstream client receives
//! `load1` before any reconnect output is forwarded.

use crate::core::frdp::{FrdpMessage, FRDP_VERSION};
use crate::core::message::LineCodec;
use crate::core::router::{BroadcastOpts, Engine, LineOutcome};
use crate::core::state::UpstreamTarget;
use crate::core::RouterError;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Why a connection cycle ended.
enum CycleEnd {
    /// Router shutdown requested.
    Shutdown,
    /// Operator switched the upstream target.
    Reconfigured,
    /// Dial failure or connection loss. `was_live` tells whether the
    /// connection had been established.
    Lost { was_live: bool },
}

/// The supervisor task for the upstream session.
pub struct UpstreamWorker {
    engine: Engine,
    reconfigure_rx: broadcast::Receiver<()>,
}

impl UpstreamWorker {
    pub fn new(engine: Engine, reconfigure_rx: broadcast::Receiver<()>) -> Self {
        Self {
            engine,
            reconfigure_rx,
        }
    }

    /// The main reconnect loop.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Upstream supervisor started.");
        let mut delay = INITIAL_RECONNECT_DELAY;
        let mut last_target: Option<UpstreamTarget> = None;

        loop {
            let target = self.engine.state.upstream.target.lock().await.clone();
            if last_target.as_ref() != Some(&target) {
                info!(
                    "Upstream target is {} ({}:{})",
                    target.name, target.host, target.port
                );
                last_target = Some(target.clone());
                delay = INITIAL_RECONNECT_DELAY;
            }

            match self.connection_cycle(&target, &mut shutdown_rx).await {
                CycleEnd::Shutdown => {
                    info!("Upstream supervisor shutting down.");
                    return;
                }
                CycleEnd::Reconfigured => {
                    info!("Upstream switchover requested, reconnecting immediately.");
                    delay = INITIAL_RECONNECT_DELAY;
                    continue;
                }
                CycleEnd::Lost { was_live } => {
                    if was_live {
                        delay = INITIAL_RECONNECT_DELAY;
                    }
                }
            }

            debug!("Sleeping {:.1} s before reconnect", delay.as_secs_f64());
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = self.reconfigure_rx.recv() => {
                    delay = INITIAL_RECONNECT_DELAY;
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    /// One dial-connect-read cycle against the current target.
    async fn connection_cycle(
        &mut self,
        target: &UpstreamTarget,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> CycleEnd {
        let state = self.engine.state.clone();

        let stream = tokio::select! {
            _ = shutdown_rx.recv() => return CycleEnd::Shutdown,
            _ = self.reconfigure_rx.recv() => return CycleEnd::Reconfigured,
            result = TcpStream::connect((target.host.as_str(), target.port)) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        "Upstream connection to {}:{} failed: {e}",
                        target.host, target.port
                    );
                    return CycleEnd::Lost { was_live: false };
                }
            }
        };
        info!("Connected to upstream {}:{}", target.host, target.port);
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LineCodec::new());
        let mut writer = FramedWrite::new(write_half, LineCodec::new());

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        state.upstream.attach(tx).await;

        // Dedicated writer task so a slow upstream never blocks routing.
        let writer_state = state.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let started = Instant::now();
                if let Err(e) = writer.send(line.as_str()).await {
                    warn!("Upstream write failed: {e}");
                    break;
                }
                writer_state
                    .upstream
                    .counters
                    .record_write_time(started.elapsed().as_secs_f64());
                writer_state.upstream.counters.record_sent(line.len());
            }
        });

        self.after_connect(target).await;

        // Read loop: LIVE until EOF, error, switchover, or shutdown.
        let end = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break CycleEnd::Shutdown,
                _ = self.reconfigure_rx.recv() => break CycleEnd::Reconfigured,
                item = reader.next() => match item {
                    Some(Ok(line)) => {
                        if self.engine.handle_upstream_line(&line).await == LineOutcome::Close {
                            info!("Upstream sent exit, disconnecting.");
                            break CycleEnd::Lost { was_live: true };
                        }
                    }
                    Some(Err(RouterError::LineTooLong(max))) => {
                        warn!("Dropping over-long line (> {max} bytes) from upstream");
                        crate::core::state::StatsState::bump(&state.stats.invalid_lines);
                    }
                    Some(Err(e)) => {
                        if e.is_normal_disconnect() {
                            info!("Upstream connection closed: {e}");
                        } else {
                            warn!("Upstream connection error: {e}");
                        }
                        break CycleEnd::Lost { was_live: true };
                    }
                    None => {
                        info!("Upstream closed the connection.");
                        break CycleEnd::Lost { was_live: true };
                    }
                }
            }
        };

        state.upstream.detach().await;
        writer_task.abort();

        // Pause every extant client before any reconnect output flows.
        if matches!(end, CycleEnd::Lost { was_live: true } | CycleEnd::Reconfigured) {
            info!("Pausing clients (load1) after upstream disconnect");
            self.engine
                .broadcast_to_clients("load1", &BroadcastOpts::default())
                .await;
        }
        end
    }

    /// Handshake after TCP establishment: identity, AUTH, IDENT, demand
    /// replay, and the pending buffer.
    async fn after_connect(&self, target: &UpstreamTarget) {
        let state = &self.engine.state;
        let (simulator, router) = {
            let config = state.config.lock().await;
            (
                config.identity.simulator.clone(),
                config.identity.router.clone(),
            )
        };

        self.engine
            .send_to_upstream(&format!(
                "name={simulator}:FRANKEN.PY frankenrouter PSX router {router}"
            ))
            .await;

        if let Some(password) = &target.password {
            // A password implies the upstream is another router.
            state.upstream.peer.lock().await.is_peer_router = true;
            self.engine
                .send_to_upstream(
                    &FrdpMessage::Auth {
                        password: password.clone(),
                    }
                    .to_line(FRDP_VERSION),
                )
                .await;
        }
        self.engine
            .send_to_upstream(
                &FrdpMessage::Ident {
                    simulator,
                    router,
                    uuid: state.frdp.uuid.to_string(),
                }
                .to_line(FRDP_VERSION),
            )
            .await;

        // Re-send demand= for every keyword any client has asked for; the
        // upstream only publishes DEMAND variables while someone wants
        // them.
        let mut demanded: HashSet<String> = HashSet::new();
        for entry in state.clients.iter() {
            let session = entry.value().session.lock().await;
            demanded.extend(session.demands.iter().cloned());
        }
        for keyword in demanded {
            debug!("Replaying demand={keyword} to upstream");
            self.engine
                .send_to_upstream(&format!("demand={keyword}"))
                .await;
        }

        let pending = state.upstream.take_pending().await;
        if !pending.is_empty() {
            info!("Sending {} held messages to upstream", pending.len());
            for line in pending {
                self.engine.send_to_upstream(&line).await;
            }
        }
    }
}
