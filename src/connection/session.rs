// src/connection/session.rs

//! Defines the state associated with a single client session.

use crate::core::access::AccessLevel;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;

/// How many FRDP RTT samples are retained per client.
const RTT_SAMPLE_CAPACITY: usize = 100;

/// Access resolution for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    /// No rule matched yet; the connection is parked awaiting FRDP AUTH.
    Pending,
    Granted(AccessLevel),
}

impl AccessState {
    pub fn has_access(self) -> bool {
        matches!(self, AccessState::Granted(level) if level.has_access())
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessState::Granted(AccessLevel::Full))
    }
}

/// Holds the state specific to a single client session. Guarded by the
/// `ClientHandle` mutex; both the session's own tasks and the router core
/// touch it.
#[derive(Debug)]
pub struct ClientSession {
    pub access: AccessState,
    /// Short name shown in the status table.
    pub display_name: String,
    /// Where the display name came from (access config, name line, FRDP).
    pub display_name_source: &'static str,
    /// Parsed from `name=ID:NAME`.
    pub client_provided_id: Option<String>,
    pub client_provided_display_name: Option<String>,

    /// True once the synthesised welcome has completed; until then
    /// forwarded messages go to `pending_messages`.
    pub welcome_sent: bool,
    /// True while the welcome waits for START keywords from upstream.
    pub waiting_for_start_keywords: bool,
    /// Keywords already emitted during the welcome burst.
    pub welcome_keywords_sent: HashSet<String>,
    /// Messages that arrived before the welcome finished.
    pub pending_messages: Vec<String>,

    /// The client asked to be spared the long string variables.
    pub nolong: bool,
    /// Keywords this session has requested via `demand=`.
    pub demands: HashSet<String>,

    /// The session identified itself as another router.
    pub is_peer_router: bool,
    pub simulator_name: Option<String>,
    pub router_name: Option<String>,
    pub uuid: Option<String>,
    pub protocol_version: Option<u32>,

    /// FRDP ping bookkeeping.
    pub ping_request_id: Option<String>,
    pub ping_sent_at: Option<Instant>,
    pub last_pong: Option<Instant>,
    pub rtts: VecDeque<f64>,
    /// Downstream-client count reported by a peer router.
    pub reported_clients: u32,

    pub connected_at: Instant,
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            access: AccessState::Pending,
            display_name: "unknown".to_string(),
            display_name_source: "none",
            client_provided_id: None,
            client_provided_display_name: None,
            welcome_sent: false,
            waiting_for_start_keywords: false,
            welcome_keywords_sent: HashSet::new(),
            pending_messages: Vec::new(),
            nolong: false,
            demands: HashSet::new(),
            is_peer_router: false,
            simulator_name: None,
            router_name: None,
            uuid: None,
            protocol_version: None,
            ping_request_id: None,
            ping_sent_at: None,
            last_pong: None,
            rtts: VecDeque::new(),
            reported_clients: 0,
            connected_at: Instant::now(),
        }
    }

    pub fn record_rtt(&mut self, seconds: f64) {
        if self.rtts.len() == RTT_SAMPLE_CAPACITY {
            self.rtts.pop_front();
        }
        self.rtts.push_back(seconds);
        self.last_pong = Some(Instant::now());
    }

    pub fn rtt_mean_max(&self) -> Option<(f64, f64)> {
        if self.rtts.is_empty() {
            return None;
        }
        let sum: f64 = self.rtts.iter().sum();
        let max = self.rtts.iter().cloned().fold(f64::MIN, f64::max);
        Some((sum / self.rtts.len() as f64, max))
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}
