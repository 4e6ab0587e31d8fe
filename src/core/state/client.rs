// src/core/state/client.rs

//! The client table entry shared between the router core, the per-client
//! reader/writer tasks, and the operator surface.

use crate::connection::session::ClientSession;
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast, mpsc};

/// How many write-time samples are retained per connection for the
/// delay statistics.
const WRITE_SAMPLE_CAPACITY: usize = 1000;

/// A map of all active client connections, keyed by session id.
pub type ClientMap = Arc<DashMap<u64, Arc<ClientHandle>>>;

/// Per-connection traffic counters, shared by clients and the upstream.
#[derive(Debug, Default)]
pub struct ConnCounters {
    pub lines_sent: AtomicU64,
    pub lines_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Bytes currently sitting in the outbound queue.
    pub queued_bytes: AtomicUsize,
    /// Recent socket write durations in seconds.
    write_samples: PlMutex<VecDeque<f64>>,
}

impl ConnCounters {
    pub fn record_sent(&self, line_len: usize) {
        self.lines_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(line_len as u64 + 2, Ordering::Relaxed);
    }

    pub fn record_received(&self, line_len: usize) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(line_len as u64 + 2, Ordering::Relaxed);
    }

    pub fn record_write_time(&self, seconds: f64) {
        let mut samples = self.write_samples.lock();
        if samples.len() == WRITE_SAMPLE_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(seconds);
    }

    /// Returns `(mean, max)` of the most recent write times, in seconds.
    pub fn write_time_mean_max(&self) -> Option<(f64, f64)> {
        let samples = self.write_samples.lock();
        if samples.is_empty() {
            return None;
        }
        let sum: f64 = samples.iter().sum();
        let max = samples.iter().cloned().fold(f64::MIN, f64::max);
        Some((sum / samples.len() as f64, max))
    }

    /// Copies out the sample window for aggregate statistics.
    pub fn write_time_samples(&self) -> Vec<f64> {
        self.write_samples.lock().iter().cloned().collect()
    }
}

/// One connected downstream client. The router holds these in the client
/// table; sessions hold only their id plus this handle for enqueueing.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: u64,
    pub addr: SocketAddr,
    /// Feeds the connection's writer task. Unbounded: a stuck client is
    /// surfaced by the queue-depth warning and the operator decides.
    outbound: mpsc::UnboundedSender<String>,
    /// Signals the reader/writer tasks to terminate this session.
    pub kill: broadcast::Sender<()>,
    pub session: Mutex<ClientSession>,
    pub counters: ConnCounters,
}

impl ClientHandle {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<String>,
        kill: broadcast::Sender<()>,
        session: ClientSession,
    ) -> Self {
        Self {
            id,
            addr,
            outbound,
            kill,
            session: Mutex::new(session),
            counters: ConnCounters::default(),
        }
    }

    /// Queues a line for this client's writer task. Returns false when the
    /// writer is gone (session closing); the message is then discarded.
    pub fn enqueue(&self, line: &str) -> bool {
        if self.outbound.send(line.to_string()).is_ok() {
            self.counters
                .queued_bytes
                .fetch_add(line.len() + 2, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Asks the session's tasks to shut down.
    pub fn request_close(&self) {
        let _ = self.kill.send(());
    }
}
