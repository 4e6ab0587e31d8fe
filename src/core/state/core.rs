// src/core/state/core.rs

//! Defines the central `RouterState` struct, holding all shared
//! router-wide state.

use super::client::ClientMap;
use super::stats::StatsState;
use super::upstream::{UpstreamShared, UpstreamTarget};
use crate::config::Config;
use crate::core::RouterError;
use crate::core::access::AccessList;
use crate::core::cache::VariableCache;
use crate::core::catalogue::VariableCatalogue;
use crate::core::frdp;
use crate::core::rules::RuleTables;
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{error, warn};
use uuid::Uuid;

/// Depth of the traffic-log queue. When full, entries are dropped and
/// counted; logging must never stall forwarding.
const TRAFFIC_LOG_QUEUE_DEPTH: usize = 8192;

/// The outbound content filters, togglable at runtime via the REST API.
#[derive(Debug, Default)]
pub struct FilterFlags {
    pub elevation: AtomicBool,
    pub traffic: AtomicBool,
    pub flight_controls: AtomicBool,
}

impl FilterFlags {
    pub fn snapshot(&self) -> crate::core::rules::FilterSnapshot {
        crate::core::rules::FilterSnapshot {
            elevation: self.elevation.load(Ordering::Relaxed),
            traffic: self.traffic.load(Ordering::Relaxed),
            flight_controls: self.flight_controls.load(Ordering::Relaxed),
        }
    }
}

/// A ROUTERINFO or SHAREDINFO payload as last seen, with receive time.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub payload: serde_json::Value,
    pub received: SystemTime,
}

/// Network-wide discovery state.
#[derive(Debug)]
pub struct FrdpState {
    /// This router's stable UUID (derived from host-id + listen port).
    pub uuid: Uuid,
    /// Latest ROUTERINFO per router UUID. Duplicates arriving over
    /// indirect paths overwrite.
    pub routerinfo: DashMap<String, StoredPayload>,
    /// Latest SHAREDINFO per router UUID.
    pub sharedinfo: DashMap<String, StoredPayload>,
    /// When a `bang` was last seen anywhere in the network.
    pub last_bang: PlMutex<Option<Instant>>,
}

impl FrdpState {
    fn new(listen_port: u16) -> Self {
        Self {
            uuid: frdp::stable_router_uuid(listen_port),
            routerinfo: DashMap::new(),
            sharedinfo: DashMap::new(),
            last_bang: PlMutex::new(None),
        }
    }

    pub fn note_bang(&self) {
        *self.last_bang.lock() = Some(Instant::now());
    }

    pub fn seconds_since_bang(&self) -> Option<f64> {
        self.last_bang.lock().map(|t| t.elapsed().as_secs_f64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    In,
    Out,
}

/// One traffic-log line, queued for the dedicated writer task.
#[derive(Debug)]
pub struct TrafficEntry {
    pub when: SystemTime,
    pub direction: TrafficDirection,
    /// `server` or `client <id>` style peer description.
    pub peer: String,
    pub line: String,
}

/// Cheap handle for pushing traffic-log entries from the hot path.
#[derive(Debug)]
pub struct TrafficLogHandle {
    tx: Option<mpsc::Sender<TrafficEntry>>,
    pub dropped: AtomicU64,
}

impl TrafficLogHandle {
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queues a log entry; drops it (and counts) if the writer is behind.
    pub fn log(&self, direction: TrafficDirection, peer: &str, line: &str) {
        let Some(tx) = &self.tx else { return };
        let entry = TrafficEntry {
            when: SystemTime::now(),
            direction,
            peer: peer.to_string(),
            line: line.to_string(),
        };
        if tx.try_send(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Contains all initialized components required to spawn the router's
/// background tasks. Created once during initialization and consumed by
/// the spawner.
pub struct RouterInit {
    pub state: Arc<RouterState>,
    /// Feed of the traffic-log writer task, when traffic logging is on.
    pub traffic_log_rx: Option<mpsc::Receiver<TrafficEntry>>,
    /// Wakes the upstream supervisor after a switchover request.
    pub upstream_reconfigure_rx: broadcast::Receiver<()>,
}

/// The central struct holding all shared router-wide state. Wrapped in an
/// `Arc` and passed to every task and connection handler.
#[derive(Debug)]
pub struct RouterState {
    /// Runtime configuration. Mutable for the live-reconfiguration hooks.
    pub config: Arc<Mutex<Config>>,
    /// The variable catalogue, read-only after load.
    pub catalogue: Arc<VariableCatalogue>,
    /// The variable cache feeding welcomes and the operator display.
    pub cache: Mutex<VariableCache>,
    /// All connected downstream clients, keyed by session id.
    pub clients: ClientMap,
    /// Session ids are handed out 1-up per router run.
    pub next_client_id: AtomicU64,
    pub access: RwLock<AccessList>,
    /// REST-managed set of addresses refused at accept time.
    pub blocklist: RwLock<HashSet<IpAddr>>,
    pub filters: FilterFlags,
    pub frdp: FrdpState,
    pub upstream: UpstreamShared,
    pub stats: StatsState,
    pub traffic_log: TrafficLogHandle,
    /// Data consulted by the pure rules function.
    pub rule_tables: RuleTables,
    /// When `start` was last sent upstream, for the welcome start window.
    pub start_sent_at: PlMutex<Option<Instant>>,
    pub started_at: Instant,
}

impl RouterState {
    /// Initializes the router state from configuration and a loaded
    /// catalogue. This is the factory for the shared context.
    pub fn initialize(
        config: Config,
        catalogue: VariableCatalogue,
    ) -> Result<RouterInit, RouterError> {
        let default_upstream = config.default_upstream();
        let target = UpstreamTarget {
            name: default_upstream.name.clone(),
            host: default_upstream.host.clone(),
            port: default_upstream.port,
            password: default_upstream.password.clone(),
        };

        let (traffic_tx, traffic_rx) = if config.log.traffic {
            let (tx, rx) = mpsc::channel(TRAFFIC_LOG_QUEUE_DEPTH);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let access = AccessList::from_config(&config.access);
        let rule_tables = RuleTables::from_config(&config, &catalogue);
        let filters = FilterFlags::default();
        filters
            .elevation
            .store(config.psx.filter_elevation, Ordering::Relaxed);
        filters
            .traffic
            .store(config.psx.filter_traffic, Ordering::Relaxed);
        filters
            .flight_controls
            .store(config.psx.filter_flight_controls, Ordering::Relaxed);

        let frdp_state = FrdpState::new(config.listen.port);
        let upstream = UpstreamShared::new(target);
        let upstream_reconfigure_rx = upstream.reconfigure_tx.subscribe();

        let state = Arc::new(Self {
            config: Arc::new(Mutex::new(config)),
            catalogue: Arc::new(catalogue),
            cache: Mutex::new(VariableCache::new()),
            clients: Arc::new(DashMap::new()),
            next_client_id: AtomicU64::new(1),
            access: RwLock::new(access),
            blocklist: RwLock::new(HashSet::new()),
            filters,
            frdp: frdp_state,
            upstream,
            stats: StatsState::new(),
            traffic_log: TrafficLogHandle {
                tx: traffic_tx,
                dropped: AtomicU64::new(0),
            },
            rule_tables,
            start_sent_at: PlMutex::new(None),
            started_at: Instant::now(),
        });

        Ok(RouterInit {
            state,
            traffic_log_rx: traffic_rx,
            upstream_reconfigure_rx,
        })
    }

    /// Allocates the next session id.
    pub fn allocate_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Policy hook for broken invariants: fatal under `stop_minded`,
    /// logged otherwise.
    pub async fn invariant_broken(&self, what: &str) {
        let stop_minded = self.config.lock().await.identity.stop_minded;
        if stop_minded {
            error!("Invariant broken: {what}. stop_minded is set, exiting.");
            process::exit(1);
        }
        warn!("Invariant broken: {what}. Continuing.");
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
