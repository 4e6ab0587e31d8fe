// src/core/router.rs

//! The routing engine: takes decisions from the pure rules function and
//! applies them to the shared state, the client queues, and the upstream.
//!
//! Also owns the synthesised welcome sequence and the `bang` cache
//! replay.

use crate::connection::session::AccessState;
use crate::core::frdp::{ClientInfoPayload, FRDP_VERSION};
use crate::core::message::Message;
use crate::core::rules::{
    self, Decision, EgressScope, FilterHit, RouteAction, RouteCode, RuleEvent, SenderFacts, Source,
    DISPLAY_NAME_MAXLEN,
};
use crate::core::state::{ClientHandle, RouterState, StatsState, TrafficDirection};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Default version offered to clients when nothing has been cached yet.
/// Without at least a version line, PSX main clients will not connect.
const PSX_DEFAULT_VERSION: &str = "10.182 NG";

/// How long a welcome waits for the upstream's START burst.
const START_WAIT: Duration = Duration::from_secs(2);
const START_POLL: Duration = Duration::from_millis(10);

/// Grace period between the `exit` reply and closing the socket.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Keys the welcome emits explicitly; the cache walk must skip them.
const WELCOME_SPECIAL_KEYS: [&str; 4] = ["id", "version", "layout", "metar"];

/// What the caller should do with the connection after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    /// The session asked to close (`exit`) or was disconnected by rule.
    Close,
}

/// Destination constraints for a fan-out.
#[derive(Debug, Default, Clone)]
pub struct BroadcastOpts<'a> {
    pub exclude: Option<u64>,
    pub include_only: Option<u64>,
    /// Skip clients that toggled `nolong`.
    pub skip_nolong: bool,
    /// Pure-START semantics: peers always, others only in their welcome
    /// window; delivered keywords are marked as sent.
    pub start_only_key: Option<&'a str>,
    /// Skip clients whose display name contains this fragment.
    pub skip_name_containing: Option<&'a str>,
    /// Peer routers only.
    pub peers_only: bool,
}

/// The routing engine. Cheap to clone; all state lives behind the `Arc`.
#[derive(Clone)]
pub struct Engine {
    pub state: Arc<RouterState>,
}

impl Engine {
    pub fn new(state: Arc<RouterState>) -> Self {
        Self { state }
    }

    /// Processes one line read from a client connection.
    pub async fn handle_client_line(&self, client: &Arc<ClientHandle>, line: &str) -> LineOutcome {
        client.counters.record_received(line.len());
        StatsState::bump(&self.state.stats.lines_from_clients);
        self.state.traffic_log.log(
            TrafficDirection::In,
            &format!("client {}", client.id),
            line,
        );

        let message = Message::parse(line);
        let decision = {
            let session = client.session.lock().await;
            let facts = SenderFacts {
                source: Source::Client(client.id),
                is_peer_router: session.is_peer_router,
                can_write: session.access.can_write(),
                display_name: &session.display_name,
                simulator_name: session.simulator_name.as_deref(),
                seconds_since_connect: session.connected_at.elapsed().as_secs_f64(),
                expected_ping_id: session.ping_request_id.as_deref(),
                seconds_since_bang: self.state.frdp.seconds_since_bang(),
            };
            rules::route(
                &message,
                &facts,
                &self.state.rule_tables,
                self.state.filters.snapshot(),
                &self.state.catalogue,
            )
        };
        self.apply(decision, Source::Client(client.id), Some(client), line)
            .await
    }

    /// Processes one line read from the upstream connection.
    pub async fn handle_upstream_line(&self, line: &str) -> LineOutcome {
        self.state.upstream.counters.record_received(line.len());
        StatsState::bump(&self.state.stats.lines_from_upstream);
        self.state
            .traffic_log
            .log(TrafficDirection::In, "server", line);

        let message = Message::parse(line);
        let decision = {
            let peer = self.state.upstream.peer.lock().await;
            let facts = SenderFacts {
                source: Source::Upstream,
                is_peer_router: peer.is_peer_router,
                can_write: true,
                display_name: peer.display_name.as_deref().unwrap_or("server"),
                simulator_name: peer.simulator_name.as_deref(),
                seconds_since_connect: 0.0,
                expected_ping_id: peer.ping_request_id.as_deref(),
                seconds_since_bang: self.state.frdp.seconds_since_bang(),
            };
            rules::route(
                &message,
                &facts,
                &self.state.rule_tables,
                self.state.filters.snapshot(),
                &self.state.catalogue,
            )
        };
        self.apply(decision, Source::Upstream, None, line).await
    }

    /// Applies one routing decision.
    async fn apply(
        &self,
        decision: Decision,
        source: Source,
        client: Option<&Arc<ClientHandle>>,
        line: &str,
    ) -> LineOutcome {
        if let Some(note) = &decision.note {
            match decision.code {
                RouteCode::MessageInvalid => {
                    StatsState::bump(&self.state.stats.invalid_lines);
                    warn!("Dropping line from {source:?}: {note}");
                }
                _ => debug!("{source:?}: {note}"),
            }
        }

        match decision.code {
            RouteCode::NoWrite => StatsState::bump(&self.state.stats.observer_writes_dropped),
            RouteCode::NonPsx => StatsState::bump(&self.state.stats.unknown_keywords),
            _ => {}
        }
        match decision.filter_hit {
            Some(FilterHit::Elevation) => {
                StatsState::bump(&self.state.stats.filtered_elevation);
            }
            Some(FilterHit::Traffic) => StatsState::bump(&self.state.stats.filtered_traffic),
            Some(FilterHit::FlightControls) => {
                StatsState::bump(&self.state.stats.filtered_flight_controls);
            }
            None => {}
        }

        if let Some((key, value)) = &decision.cache {
            if self.state.catalogue.is_pure_delta(key) {
                self.state
                    .invariant_broken(&format!("attempted to cache pure-DELTA keyword {key}"))
                    .await;
            } else {
                self.state.cache.lock().await.put(key, value);
            }
        }

        let mut outcome = LineOutcome::Continue;
        if let Some(event) = decision.event.clone() {
            outcome = self.apply_event(event, source, client).await;
        }

        if let Some(reply) = &decision.reply {
            self.send_to_sender(source, client, reply).await;
        }

        match decision.action {
            RouteAction::Drop => {}
            RouteAction::Disconnect => outcome = LineOutcome::Close,
            RouteAction::UpstreamOnly => {
                if !source.is_upstream() {
                    self.send_to_upstream(line).await;
                }
            }
            RouteAction::Normal => {
                if !source.is_upstream() {
                    self.send_to_upstream(line).await;
                }
                self.broadcast_to_clients(
                    line,
                    &BroadcastOpts {
                        exclude: source_client_id(source),
                        ..Default::default()
                    },
                )
                .await;
            }
            RouteAction::Restricted(scope) => {
                let mut opts = BroadcastOpts {
                    exclude: source_client_id(source),
                    ..Default::default()
                };
                let mut to_upstream = !source.is_upstream();
                match &scope {
                    EgressScope::SkipNolong => opts.skip_nolong = true,
                    EgressScope::StartOnly { key } => opts.start_only_key = Some(key),
                    EgressScope::SkipNameMatching(fragment) => {
                        opts.skip_name_containing = Some(fragment)
                    }
                    EgressScope::PeersOnly => opts.peers_only = true,
                    EgressScope::ClientsOnly => to_upstream = false,
                }
                if to_upstream {
                    self.send_to_upstream(line).await;
                }
                self.broadcast_to_clients(line, &opts).await;
            }
        }
        outcome
    }

    /// Applies a deferred state change from the rules function.
    async fn apply_event(
        &self,
        event: RuleEvent,
        source: Source,
        client: Option<&Arc<ClientHandle>>,
    ) -> LineOutcome {
        match event {
            RuleEvent::MarkPeer => {
                self.set_peer_flag(source, client, None).await;
            }
            RuleEvent::PeerName { display_name } => {
                self.set_peer_flag(source, client, Some(display_name)).await;
            }
            RuleEvent::PongReceived { .. } => {
                self.record_pong(source, client).await;
            }
            RuleEvent::Ident {
                simulator,
                router,
                uuid,
                version,
            } => {
                if version != FRDP_VERSION {
                    StatsState::bump(&self.state.stats.frdp_version_mismatches);
                    warn!(
                        "Peer router {router} ({simulator}) speaks FRDP version {version}, \
                         we speak {FRDP_VERSION}; continuing"
                    );
                }
                match client {
                    Some(client) => {
                        let mut session = client.session.lock().await;
                        session.is_peer_router = true;
                        session.simulator_name = Some(simulator);
                        session.display_name = router.clone();
                        session.display_name_source = "FRDP IDENT";
                        session.router_name = Some(router);
                        session.uuid = Some(uuid);
                        session.protocol_version = Some(version);
                    }
                    None => {
                        let mut peer = self.state.upstream.peer.lock().await;
                        peer.is_peer_router = true;
                        peer.simulator_name = Some(simulator);
                        peer.display_name = Some(router.clone());
                        peer.router_name = Some(router);
                        peer.uuid = Some(uuid);
                        peer.protocol_version = Some(version);
                    }
                }
            }
            RuleEvent::Auth { password } => {
                if let Some(client) = client {
                    return self.try_authenticate(client, &password).await;
                }
            }
            RuleEvent::RouterInfo { json } => {
                self.store_discovery_payload(&json, true);
            }
            RuleEvent::SharedInfo { json } => {
                self.store_discovery_payload(&json, false);
            }
            RuleEvent::ClientInfo { json } => {
                self.apply_clientinfo(&json).await;
            }
            RuleEvent::NameLearned {
                display_name,
                provided_id,
                provided_name,
            } => {
                if let Some(client) = client {
                    let mut session = client.session.lock().await;
                    info!(
                        "Client {} identifies as {display_name}, using that name",
                        client.id
                    );
                    session.display_name = display_name;
                    session.display_name_source = "name line";
                    session.client_provided_id = provided_id;
                    session.client_provided_display_name = provided_name;
                }
            }
            RuleEvent::ToggleNolong => {
                if let Some(client) = client {
                    let mut session = client.session.lock().await;
                    session.nolong = !session.nolong;
                    info!("Client {} toggled nolong to {}", client.id, session.nolong);
                }
            }
            RuleEvent::Demand { keyword } => {
                if let Some(client) = client {
                    client.session.lock().await.demands.insert(keyword);
                }
            }
            RuleEvent::StartSent => {
                *self.state.start_sent_at.lock() = Some(Instant::now());
            }
            RuleEvent::NoteBang => self.state.frdp.note_bang(),
            RuleEvent::BangReplay => {
                self.state.frdp.note_bang();
                if let Some(client) = client {
                    self.bang_replay(client).await;
                }
            }
            RuleEvent::CloseSession => {
                if let Some(client) = client {
                    self.close_client(client, "exit received").await;
                }
                return LineOutcome::Close;
            }
        }
        LineOutcome::Continue
    }

    async fn set_peer_flag(
        &self,
        source: Source,
        client: Option<&Arc<ClientHandle>>,
        display_name: Option<String>,
    ) {
        match (source, client) {
            (Source::Client(_), Some(client)) => {
                let mut session = client.session.lock().await;
                if !session.is_peer_router {
                    info!("Client {} identified as a peer router", client.id);
                }
                session.is_peer_router = true;
                if let Some(name) = display_name {
                    session.display_name = name;
                    session.display_name_source = "name line";
                }
            }
            _ => {
                let mut peer = self.state.upstream.peer.lock().await;
                peer.is_peer_router = true;
                if let Some(name) = display_name {
                    peer.display_name = Some(name);
                }
            }
        }
    }

    async fn record_pong(&self, source: Source, client: Option<&Arc<ClientHandle>>) {
        let rtt_warning = self.state.config.lock().await.performance.frdp_rtt_warning;
        let rtt = match client {
            Some(client) => {
                let mut session = client.session.lock().await;
                let rtt = session
                    .ping_sent_at
                    .map(|sent| sent.elapsed().as_secs_f64());
                session.ping_request_id = None;
                // A PONG to our solicited PING is proof of a peer router.
                session.is_peer_router = true;
                if let Some(rtt) = rtt {
                    session.record_rtt(rtt);
                }
                rtt
            }
            None => {
                let mut peer = self.state.upstream.peer.lock().await;
                let rtt = peer.ping_sent_at.map(|sent| sent.elapsed().as_secs_f64());
                peer.ping_request_id = None;
                peer.is_peer_router = true;
                if let Some(rtt) = rtt {
                    peer.record_rtt(rtt);
                }
                rtt
            }
        };
        if let Some(rtt) = rtt
            && rtt > rtt_warning
        {
            warn!("SLOW: FRDP RTT to {source:?} is {rtt:.6} s");
        }
    }

    /// Evaluates the access rules for a parked client that sent FRDP AUTH.
    async fn try_authenticate(&self, client: &Arc<ClientHandle>, password: &str) -> LineOutcome {
        if password.is_empty() {
            // Empty passwords never authenticate.
            self.send_to_sender(Source::Client(client.id), Some(client), "unauthorized")
                .await;
            return LineOutcome::Close;
        }
        let already = client.session.lock().await.access.has_access();
        if already {
            debug!("Client {} re-authenticated needlessly", client.id);
            return LineOutcome::Continue;
        }
        let access = self.state.access.read().await;
        let (level, rule_name) = access.level_for(client.addr.ip(), Some(password));
        let rule_name = rule_name.map(|s| s.to_string());
        drop(access);

        if !level.has_access() {
            warn!(
                "Client {} failed to authenticate from {}",
                client.id, client.addr
            );
            self.send_to_sender(Source::Client(client.id), Some(client), "unauthorized")
                .await;
            sleep(EXIT_GRACE).await;
            client.request_close();
            return LineOutcome::Close;
        }

        {
            let mut session = client.session.lock().await;
            session.access = AccessState::Granted(level);
            if let Some(name) = rule_name {
                session.display_name = name;
                session.display_name_source = "access config";
            }
            info!(
                "Client {} authenticated, access level {}",
                client.id,
                level.as_str()
            );
        }
        self.welcome_client(client).await;
        LineOutcome::Continue
    }

    fn store_discovery_payload(&self, json: &str, is_routerinfo: bool) {
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(json) else {
            return;
        };
        let uuid = payload
            .get("uuid")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let stored = crate::core::state::StoredPayload {
            payload,
            received: SystemTime::now(),
        };
        if is_routerinfo {
            self.state.frdp.routerinfo.insert(uuid, stored);
        } else {
            self.state.frdp.sharedinfo.insert(uuid, stored);
        }
    }

    /// Applies one-hop CLIENTINFO naming data: finds the described client
    /// by its local address and sets its display name.
    async fn apply_clientinfo(&self, json: &str) {
        let Ok(payload) = serde_json::from_str::<ClientInfoPayload>(json) else {
            warn!("Discarding CLIENTINFO with unusable payload");
            return;
        };
        let mut applied = false;
        for entry in self.state.clients.iter() {
            let client = entry.value();
            if client.addr.ip().to_string() == payload.laddr && client.addr.port() == payload.lport
            {
                let mut session = client.session.lock().await;
                let name: String = payload.name.chars().take(DISPLAY_NAME_MAXLEN).collect();
                if payload.name.len() > DISPLAY_NAME_MAXLEN {
                    warn!("Client name {} is too long, using {name}", payload.name);
                }
                session.display_name = name;
                session.display_name_source = "FRDP CLIENTINFO";
                applied = true;
                break;
            }
        }
        if !applied {
            warn!(
                "Got CLIENTINFO for non-connected client {}:{}",
                payload.laddr, payload.lport
            );
        }
    }

    async fn send_to_sender(
        &self,
        source: Source,
        client: Option<&Arc<ClientHandle>>,
        line: &str,
    ) {
        match (source, client) {
            (Source::Client(_), Some(client)) => {
                client.enqueue(line);
                self.state.traffic_log.log(
                    TrafficDirection::Out,
                    &format!("client {}", client.id),
                    line,
                );
            }
            _ => self.send_to_upstream(line).await,
        }
    }

    /// Sends a line to the upstream, or buffers it while disconnected.
    pub async fn send_to_upstream(&self, line: &str) {
        self.state.upstream.send(line).await;
        self.state
            .traffic_log
            .log(TrafficDirection::Out, "server", line);
    }

    /// Fans a line out to the connected clients.
    ///
    /// The welcome invariant lives here: anything rule 3 would deliver to
    /// a not-yet-welcomed client is appended to its pending queue instead,
    /// unless the line is part of the welcome (the start-only path).
    pub async fn broadcast_to_clients(&self, line: &str, opts: &BroadcastOpts<'_>) {
        let mut sent_to: Vec<u64> = Vec::new();
        for entry in self.state.clients.iter() {
            let client = entry.value();
            if opts.exclude == Some(client.id) {
                continue;
            }
            if let Some(only) = opts.include_only
                && only != client.id
            {
                continue;
            }
            let mut session = client.session.lock().await;
            if !session.access.has_access() {
                continue;
            }
            if opts.peers_only && !session.is_peer_router {
                continue;
            }
            if opts.skip_nolong && session.nolong {
                continue;
            }
            if let Some(fragment) = opts.skip_name_containing
                && session.display_name.contains(fragment)
            {
                continue;
            }
            if let Some(key) = opts.start_only_key {
                if session.is_peer_router {
                    // Peers take START keywords at all times.
                } else if session.waiting_for_start_keywords {
                    session.welcome_keywords_sent.insert(key.to_string());
                } else {
                    continue;
                }
                client.enqueue(line);
                sent_to.push(client.id);
                continue;
            }
            if !session.welcome_sent {
                session.pending_messages.push(line.to_string());
                continue;
            }
            drop(session);
            client.enqueue(line);
            sent_to.push(client.id);
        }
        if !sent_to.is_empty() {
            let peers = format!(
                "clients {}",
                sent_to
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            self.state
                .traffic_log
                .log(TrafficDirection::Out, &peers, line);
        }
    }

    /// Replies to a client's `bang` with every non-DELTA cache entry in
    /// catalogue order.
    pub async fn bang_replay(&self, client: &Arc<ClientHandle>) {
        let snapshot = {
            let cache = self.state.cache.lock().await;
            cache.snapshot_for_welcome(&self.state.catalogue)
        };
        debug!(
            "Answering bang from client {} with {} cached keywords",
            client.id,
            snapshot.len()
        );
        for (key, value) in snapshot {
            client.enqueue(&format!("{key}={value}"));
        }
    }

    /// Emits the synthesised welcome to a freshly accepted client. Built
    /// entirely from the cache; never blocks on the upstream.
    pub async fn welcome_client(&self, client: &Arc<ClientHandle>) {
        let started = Instant::now();
        {
            let cache = self.state.cache.lock().await;
            info!(
                "Adding client {} to network ({} keywords cached)",
                client.id,
                cache.len()
            );
            if cache.len() < 10 {
                warn!("Router cache probably not initialized, some clients might misbehave");
            }
        }

        // The client gets the router's own id for it, never the upstream's.
        self.welcome_line(client, &format!("id={}", client.id)).await;
        {
            let mut session = client.session.lock().await;
            session.welcome_keywords_sent.insert("id".to_string());
        }

        // A version line is mandatory for PSX clients; fabricate the
        // baseline when nothing has been cached. Layout is omitted when
        // absent.
        {
            let mut cache = self.state.cache.lock().await;
            if !cache.contains("version") {
                cache.put("version", PSX_DEFAULT_VERSION);
            }
        }
        self.send_if_unsent(client, "version").await;
        self.send_if_unsent(client, "layout").await;

        // The lexicon block, in catalogue order.
        let lexicon_keys: Vec<String> = {
            let cache = self.state.cache.lock().await;
            cache
                .keywords_in_catalogue_order(&self.state.catalogue)
                .into_iter()
                .filter(|k| k.starts_with("Ls") || k.starts_with("Lh") || k.starts_with("Li"))
                .collect()
        };
        for key in &lexicon_keys {
            self.send_if_unsent(client, key).await;
        }

        self.welcome_line(client, "load1").await;

        // Ask the upstream for fresh START data and give it a moment to
        // arrive; the welcome proceeds regardless.
        client.session.lock().await.waiting_for_start_keywords = true;
        self.send_to_upstream("start").await;
        let start_sent = Instant::now();
        *self.state.start_sent_at.lock() = Some(start_sent);

        let expected: Vec<String> = self
            .state
            .catalogue
            .pure_start_keywords()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        while self.state.upstream.is_connected() && !expected.is_empty() {
            sleep(START_POLL).await;
            let session = client.session.lock().await;
            let missing = expected
                .iter()
                .filter(|k| !session.welcome_keywords_sent.contains(*k))
                .count();
            drop(session);
            if missing == 0 {
                debug!("All expected START keywords received, continuing");
                break;
            }
            if start_sent.elapsed() > START_WAIT {
                warn!(
                    "Waited {:.1} s for START data, missing {missing} of {}, continuing anyway",
                    start_sent.elapsed().as_secs_f64(),
                    expected.len()
                );
                break;
            }
        }
        client.session.lock().await.waiting_for_start_keywords = false;

        // Walk the cache in catalogue order and send everything that is
        // not pure-DELTA and was not already part of the burst.
        let snapshot = {
            let cache = self.state.cache.lock().await;
            cache.snapshot_for_welcome(&self.state.catalogue)
        };
        for (key, _) in &snapshot {
            if WELCOME_SPECIAL_KEYS.contains(&key.as_str())
                || key.starts_with("Ls")
                || key.starts_with("Lh")
                || key.starts_with("Li")
            {
                continue;
            }
            self.send_if_unsent(client, key).await;
        }

        self.welcome_line(client, "load2").await;
        self.welcome_line(client, "load3").await;
        self.send_if_unsent(client, "metar").await;

        // Welcome done: release anything that queued up meanwhile.
        let pending = {
            let mut session = client.session.lock().await;
            session.welcome_sent = true;
            session.welcome_keywords_sent.clear();
            std::mem::take(&mut session.pending_messages)
        };
        if !pending.is_empty() {
            info!(
                "Sending {} held messages to client {}",
                pending.len(),
                client.id
            );
            for line in pending {
                client.enqueue(&line);
            }
        }

        // Identify ourselves, in case the client is another router.
        let identity = {
            let config = self.state.config.lock().await;
            format!(
                "name={}:FRANKEN.PY frankenrouter PSX router {}",
                config.identity.simulator, config.identity.router
            )
        };
        self.welcome_line(client, &identity).await;

        info!(
            "Added client {} in {:.1} ms",
            client.id,
            started.elapsed().as_secs_f64() * 1000.0
        );
    }

    /// Sends one literal welcome line.
    async fn welcome_line(&self, client: &Arc<ClientHandle>, line: &str) {
        client.enqueue(line);
        self.state.traffic_log.log(
            TrafficDirection::Out,
            &format!("client {}", client.id),
            line,
        );
    }

    /// Sends `key=<cached value>` unless the keyword is absent, pure-DELTA,
    /// or already part of this client's welcome burst.
    async fn send_if_unsent(&self, client: &Arc<ClientHandle>, key: &str) {
        if self.state.catalogue.is_pure_delta(key) {
            debug!("Not sending DELTA variable {key} to client");
            return;
        }
        let value = {
            let cache = self.state.cache.lock().await;
            cache.get(key).map(|v| v.to_string())
        };
        let Some(value) = value else {
            debug!("Keyword {key} not in cache, cannot send");
            return;
        };
        let mut session = client.session.lock().await;
        if session.welcome_keywords_sent.contains(key) {
            return;
        }
        session.welcome_keywords_sent.insert(key.to_string());
        drop(session);
        self.welcome_line(client, &format!("{key}={value}")).await;
    }

    /// Acknowledges an `exit`, lets the writer flush, and tears the
    /// session down.
    pub async fn close_client(&self, client: &Arc<ClientHandle>, reason: &str) {
        info!("Closing client {}: {reason}", client.id);
        client.enqueue("exit");
        sleep(EXIT_GRACE).await;
        client.request_close();
    }
}

fn source_client_id(source: Source) -> Option<u64> {
    match source {
        Source::Client(id) => Some(id),
        Source::Upstream => None,
    }
}
