// src/core/state/upstream.rs

//! Shared state for the singleton upstream session.

use super::client::ConnCounters;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, broadcast, mpsc};

/// How many FRDP RTT samples are retained for the upstream.
const RTT_SAMPLE_CAPACITY: usize = 100;

/// The upstream the router should be connected to. Replaced atomically on
/// switchover; the reconnect loop picks the new target up on its next
/// dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

/// FRDP-related facts about the upstream peer.
#[derive(Debug, Default)]
pub struct UpstreamPeer {
    pub is_peer_router: bool,
    pub display_name: Option<String>,
    pub simulator_name: Option<String>,
    pub router_name: Option<String>,
    pub uuid: Option<String>,
    pub protocol_version: Option<u32>,
    pub ping_request_id: Option<String>,
    pub ping_sent_at: Option<Instant>,
    pub last_pong: Option<Instant>,
    pub rtts: VecDeque<f64>,
}

impl UpstreamPeer {
    pub fn record_rtt(&mut self, seconds: f64) {
        if self.rtts.len() == RTT_SAMPLE_CAPACITY {
            self.rtts.pop_front();
        }
        self.rtts.push_back(seconds);
        self.last_pong = Some(Instant::now());
    }
}

/// Shared state for the upstream session: target, liveness, the outbound
/// channel of the current connection, and the pending buffer used while
/// disconnected.
#[derive(Debug)]
pub struct UpstreamShared {
    pub target: Mutex<UpstreamTarget>,
    pub connected: AtomicBool,
    /// Sender into the live connection's writer task, when one exists.
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Lines routed upstream while no connection exists; flushed on the
    /// next LIVE entry.
    pending: Mutex<Vec<String>>,
    pub counters: ConnCounters,
    pub peer: Mutex<UpstreamPeer>,
    pub reconnects: AtomicU64,
    /// Wakes the reconnect loop after a switchover request.
    pub reconfigure_tx: broadcast::Sender<()>,
}

impl UpstreamShared {
    pub fn new(target: UpstreamTarget) -> Self {
        let (reconfigure_tx, _) = broadcast::channel(1);
        Self {
            target: Mutex::new(target),
            connected: AtomicBool::new(false),
            tx: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            counters: ConnCounters::default(),
            peer: Mutex::new(UpstreamPeer::default()),
            reconnects: AtomicU64::new(0),
            reconfigure_tx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Sends a line upstream, or stores it for the next connection.
    pub async fn send(&self, line: &str) {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) if tx.send(line.to_string()).is_ok() => {}
            _ => {
                drop(tx);
                let mut pending = self.pending.lock().await;
                pending.push(line.to_string());
            }
        }
    }

    /// Installs the writer channel of a freshly established connection.
    pub async fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        *self.tx.lock().await = Some(tx);
        self.connected.store(true, Ordering::Relaxed);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Tears down the current connection's channel.
    pub async fn detach(&self) {
        *self.tx.lock().await = None;
        self.connected.store(false, Ordering::Relaxed);
        let mut peer = self.peer.lock().await;
        peer.ping_request_id = None;
        peer.ping_sent_at = None;
    }

    /// Takes the buffered lines for replay after reconnect.
    pub async fn take_pending(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock().await)
    }

    /// Requests a switchover to a new target. The reconnect loop closes
    /// the current connection and dials the new target.
    pub async fn switch_target(&self, target: UpstreamTarget) {
        *self.target.lock().await = target;
        let _ = self.reconfigure_tx.send(());
    }
}
