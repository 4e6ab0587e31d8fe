// src/connection/handler.rs

//! Defines the `ClientHandler` which manages the full lifecycle of a
//! downstream client connection: access check, synthesised welcome, and
//! the read loop feeding the routing engine.

use super::guard::ConnectionGuard;
use super::session::{AccessState, ClientSession};
use crate::core::RouterError;
use crate::core::access::AccessLevel;
use crate::core::message::LineCodec;
use crate::core::router::{Engine, LineOutcome};
use crate::core::state::{ClientHandle, StatsState};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// Manages the full lifecycle of one client connection.
pub struct ClientHandler {
    engine: Engine,
    client: Arc<ClientHandle>,
    global_shutdown_rx: broadcast::Receiver<()>,
}

impl ClientHandler {
    /// Registers the connection in the client table and spawns its writer
    /// task. The caller spawns `run` afterwards.
    pub fn new(
        engine: Engine,
        socket: TcpStream,
        addr: SocketAddr,
        global_shutdown_rx: broadcast::Receiver<()>,
    ) -> (Self, FramedRead<tokio::net::tcp::OwnedReadHalf, LineCodec>) {
        let _ = socket.set_nodelay(true);
        let (read_half, write_half) = socket.into_split();
        let reader = FramedRead::new(read_half, LineCodec::new());

        let id = engine.state.allocate_client_id();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (kill_tx, _) = broadcast::channel(1);

        let client = Arc::new(ClientHandle::new(
            id,
            addr,
            outbound_tx,
            kill_tx.clone(),
            ClientSession::new(),
        ));
        engine.state.clients.insert(id, client.clone());

        let slow_write_warning = engine
            .state
            .config
            .try_lock()
            .map(|config| config.performance.queue_time_warning)
            .unwrap_or(0.016);
        spawn_writer(
            client.clone(),
            FramedWrite::new(write_half, LineCodec::new()),
            outbound_rx,
            kill_tx.subscribe(),
            slow_write_warning,
        );

        (
            Self {
                engine,
                client,
                global_shutdown_rx,
            },
            reader,
        )
    }

    /// The connection's main loop: access check, welcome, then one
    /// decision per line until the session ends.
    pub async fn run(
        mut self,
        mut reader: FramedRead<tokio::net::tcp::OwnedReadHalf, LineCodec>,
    ) {
        let state = self.engine.state.clone();
        let _guard = ConnectionGuard::new(state.clone(), self.client.id, self.client.addr);

        if !self.initial_access_check().await {
            return;
        }

        let total_delay_warning = {
            let config = state.config.lock().await;
            config.performance.total_delay_warning
        };

        let mut kill_rx = self.client.kill.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = self.global_shutdown_rx.recv() => {
                    debug!("Client {} handler received global shutdown.", self.client.id);
                    break;
                }
                _ = kill_rx.recv() => {
                    debug!("Client {} handler received kill signal.", self.client.id);
                    break;
                }
                item = reader.next() => match item {
                    Some(Ok(line)) => {
                        let read_at = Instant::now();
                        let outcome = self.engine.handle_client_line(&self.client, &line).await;
                        let elapsed = read_at.elapsed().as_secs_f64();
                        if outcome == LineOutcome::Continue && elapsed > total_delay_warning {
                            warn!(
                                "Forwarding delay for client {} was {elapsed:.6} s",
                                self.client.id
                            );
                        }
                        match outcome {
                            LineOutcome::Continue => {}
                            LineOutcome::Close => break,
                        }
                    }
                    Some(Err(RouterError::LineTooLong(max))) => {
                        warn!(
                            "Dropping over-long line (> {max} bytes) from client {}",
                            self.client.id
                        );
                        StatsState::bump(&state.stats.invalid_lines);
                    }
                    Some(Err(e)) => {
                        if e.is_normal_disconnect() {
                            debug!("Client {} connection closed: {e}", self.client.id);
                        } else {
                            warn!("Client {} connection error: {e}", self.client.id);
                        }
                        break;
                    }
                    None => {
                        debug!("Client {} closed the connection.", self.client.id);
                        break;
                    }
                }
            }
        }
        self.client.request_close();
    }

    /// Applies the access rules to the bare connection (no password yet).
    /// Returns false when the connection must be dropped.
    async fn initial_access_check(&mut self) -> bool {
        let ip = self.client.addr.ip();

        if self.engine.state.blocklist.read().await.contains(&ip) {
            warn!("Blocklisted client {ip} connected, closing connection");
            self.client.enqueue("unauthorized");
            tokio::time::sleep(Duration::from_millis(100)).await;
            return false;
        }

        let access = self.engine.state.access.read().await;
        let matched = access.evaluate(ip, None).map(|rule| {
            (rule.level, rule.display_name.clone())
        });
        let can_wait_for_auth = access.has_password_rules();
        drop(access);

        match matched {
            Some((AccessLevel::Blocked, name)) => {
                warn!("Blocked client {ip} (rule '{name}'), closing connection");
                self.client.enqueue("unauthorized");
                tokio::time::sleep(Duration::from_millis(100)).await;
                false
            }
            Some((level, name)) => {
                {
                    let mut session = self.client.session.lock().await;
                    session.access = AccessState::Granted(level);
                    session.display_name = name.clone();
                    session.display_name_source = "access config";
                }
                info!(
                    "Client {} ({ip}) identified as {name}, access level {}",
                    self.client.id,
                    level.as_str()
                );
                self.engine.welcome_client(&self.client).await;
                true
            }
            None if can_wait_for_auth => {
                // Parked: the welcome begins if and when FRDP AUTH
                // succeeds.
                info!(
                    "Client {} ({ip}) matches no access rule, awaiting authentication",
                    self.client.id
                );
                self.client
                    .enqueue("addon=frankenrouter:authorization required");
                true
            }
            None => {
                warn!("Client {ip} matches no access rule, closing connection");
                self.client.enqueue("unauthorized");
                tokio::time::sleep(Duration::from_millis(100)).await;
                false
            }
        }
    }
}

/// Drains the outbound queue onto the socket, keeping the write-time
/// statistics and the queue-depth gauge.
fn spawn_writer(
    client: Arc<ClientHandle>,
    mut writer: FramedWrite<OwnedWriteHalf, LineCodec>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut kill_rx: broadcast::Receiver<()>,
    slow_write_warning: f64,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = kill_rx.recv() => break,
                line = outbound_rx.recv() => {
                    let Some(line) = line else { break };
                    client
                        .counters
                        .queued_bytes
                        .fetch_sub(line.len() + 2, Ordering::Relaxed);
                    let started = Instant::now();
                    if let Err(e) = writer.send(line.as_str()).await {
                        debug!("Write to client {} failed: {e}", client.id);
                        break;
                    }
                    let elapsed = started.elapsed().as_secs_f64();
                    if elapsed > slow_write_warning {
                        warn!(
                            "SLOW: write to client {} took {elapsed:.6} s",
                            client.id
                        );
                    }
                    client.counters.record_write_time(elapsed);
                    client.counters.record_sent(line.len());
                }
            }
        }
    });
}
