// src/core/rules.rs

//! Message routing rules.
//!
//! `route` is a pure function: it looks at one parsed message plus
//! pre-computed facts about the sender and returns what the router must
//! do. All clock readings arrive as elapsed durations inside
//! `SenderFacts`, so identical inputs always produce identical outputs.
//! Side effects (cache writes, session mutation, FRDP bookkeeping) are
//! described in the returned `Decision` and applied by the routing
//! engine.

use crate::config::{Config, UnknownKeywordPolicy};
use crate::core::catalogue::VariableCatalogue;
use crate::core::frdp::{self, FrdpMessage, FrdpParse, FRDP_VERSION, PEER_NAME_SIGNATURE};
use crate::core::message::Message;
use std::collections::HashSet;

/// Display names are capped to keep the status table aligned.
pub const DISPLAY_NAME_MAXLEN: usize = 24;

/// Seconds after a `bang` during which Qi191 is withheld from PSX Sounds.
const BANG_GUARD_SECS: f64 = 2.0;

/// Seconds after connect during which Qs119 from BACARS is discarded.
const BACARS_GUARD_SECS: f64 = 15.0;

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Upstream,
    Client(u64),
}

impl Source {
    pub fn is_upstream(self) -> bool {
        matches!(self, Source::Upstream)
    }
}

/// Static keyword tables the rules consult. Built once from config and
/// catalogue; the special cases live here as data, not code.
#[derive(Debug, Clone)]
pub struct RuleTables {
    /// Ground-elevation injection keywords, dropped under the elevation
    /// filter.
    pub elevation_keywords: HashSet<String>,
    /// TCAS traffic-injection keywords, dropped under the traffic filter.
    pub traffic_keywords: HashSet<String>,
    /// Rudder/aileron/elevator axes, dropped under the flight-control
    /// lock.
    pub flight_control_keywords: HashSet<String>,
    /// Long string variables withheld from `nolong` clients.
    pub nolong_keywords: HashSet<String>,
    pub our_simulator: String,
    pub forward_quit_upstream: bool,
    pub unknown_policy: UnknownKeywordPolicy,
}

impl RuleTables {
    pub fn from_config(config: &Config, catalogue: &VariableCatalogue) -> Self {
        let nolong = match &config.psx.nolong_keywords {
            Some(list) => list.iter().cloned().collect(),
            None => catalogue.nolong_keywords().into_iter().collect(),
        };
        Self {
            elevation_keywords: ["Qi198"].iter().map(|s| s.to_string()).collect(),
            traffic_keywords: ["Qs439", "Qs440"].iter().map(|s| s.to_string()).collect(),
            flight_control_keywords: ["Qs120"].iter().map(|s| s.to_string()).collect(),
            nolong_keywords: nolong,
            our_simulator: config.identity.simulator.clone(),
            forward_quit_upstream: config.identity.forward_quit_upstream,
            unknown_policy: config.psx.unknown_keywords,
        }
    }
}

/// The filter flags at the moment of the decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterSnapshot {
    pub elevation: bool,
    pub traffic: bool,
    pub flight_controls: bool,
}

/// Facts about the sender, captured by the engine before calling `route`.
#[derive(Debug, Clone)]
pub struct SenderFacts<'a> {
    pub source: Source,
    pub is_peer_router: bool,
    pub can_write: bool,
    pub display_name: &'a str,
    pub simulator_name: Option<&'a str>,
    pub seconds_since_connect: f64,
    /// Nonce of the PING we last sent to this peer, if unanswered.
    pub expected_ping_id: Option<&'a str>,
    /// Seconds since a `bang` was last seen anywhere in the network.
    pub seconds_since_bang: Option<f64>,
}

/// The action the router must take for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Do not forward.
    Drop,
    /// Do not forward and close the sender's connection.
    Disconnect,
    /// Send to the upstream only.
    UpstreamOnly,
    /// Send to the upstream and to every other client whose access allows
    /// it.
    Normal,
    /// Send to a restricted subset of destinations.
    Restricted(EgressScope),
}

/// Restriction applied on top of the normal fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressScope {
    /// Skip clients that toggled `nolong`.
    SkipNolong,
    /// Pure-START keyword: peer routers always, other clients only inside
    /// their welcome window.
    StartOnly { key: String },
    /// Skip clients whose display name matches this pattern.
    SkipNameMatching(&'static str),
    /// Peer routers (and the upstream) only.
    PeersOnly,
    /// Downstream clients only, never the upstream.
    ClientsOnly,
}

/// Which filter table dropped a message, for the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHit {
    Elevation,
    Traffic,
    FlightControls,
}

/// A deferred state change the engine applies after the decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEvent {
    /// The sender revealed itself as a peer router.
    MarkPeer,
    /// The sender's `name=` line carried the router signature: mark it as
    /// a peer and take the display name.
    PeerName { display_name: String },
    PongReceived { id: String },
    Ident {
        simulator: String,
        router: String,
        uuid: String,
        version: u32,
    },
    Auth { password: String },
    RouterInfo { json: String },
    ClientInfo { json: String },
    SharedInfo { json: String },
    NameLearned {
        display_name: String,
        provided_id: Option<String>,
        provided_name: Option<String>,
    },
    ToggleNolong,
    Demand { keyword: String },
    /// `start` is on its way upstream; note the send time.
    StartSent,
    NoteBang,
    /// `bang` from a client: answer with the non-DELTA cache contents.
    BangReplay,
    /// `exit`: acknowledge and close the sender.
    CloseSession,
}

/// The code for a routing decision. Some codes are informational, some
/// feed counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCode {
    MessageInvalid,
    FallbackRule,
    FrdpPing,
    FrdpPong,
    FrdpIdent,
    FrdpAuth,
    FrdpBang,
    FrdpRouterInfo,
    FrdpClientInfo,
    FrdpSharedInfo,
    NameFromPeer,
    NameLearned,
    Nolong,
    NonPsx,
    NoWrite,
    Demand,
    AddonForwarded,
    Again,
    Start,
    Quit,
    Layout,
    Load1,
    Load2,
    Load3,
    Bang,
    Exit,
    CachedOnly,
    KeyValueFilteredIngress,
    KeyValueFilteredEgress,
    KeyValueNormal,
}

/// A routing decision.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: RouteAction,
    pub code: RouteCode,
    /// Human-readable context for log lines.
    pub note: Option<String>,
    /// A line to send back to the sender.
    pub reply: Option<String>,
    /// Store this pair in the cache before forwarding.
    pub cache: Option<(String, String)>,
    pub event: Option<RuleEvent>,
    pub filter_hit: Option<FilterHit>,
}

impl Decision {
    fn new(action: RouteAction, code: RouteCode) -> Self {
        Self {
            action,
            code,
            note: None,
            reply: None,
            cache: None,
            event: None,
            filter_hit: None,
        }
    }

    fn drop(code: RouteCode) -> Self {
        Self::new(RouteAction::Drop, code)
    }

    fn invalid(note: impl Into<String>) -> Self {
        let mut decision = Self::drop(RouteCode::MessageInvalid);
        decision.note = Some(note.into());
        decision
    }

    fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    fn with_reply(mut self, reply: String) -> Self {
        self.reply = Some(reply);
        self
    }

    fn with_cache(mut self, key: &str, value: &str) -> Self {
        self.cache = Some((key.to_string(), value.to_string()));
        self
    }

    fn with_event(mut self, event: RuleEvent) -> Self {
        self.event = Some(event);
        self
    }
}

/// Decides what to do with one message. Pure: consult, never mutate.
pub fn route(
    message: &Message,
    facts: &SenderFacts,
    tables: &RuleTables,
    filters: FilterSnapshot,
    catalogue: &VariableCatalogue,
) -> Decision {
    let key = message.key();

    if key.is_empty() {
        return Decision::invalid("empty line");
    }

    if key == "name" {
        return handle_name(message.value().unwrap_or(""), facts);
    }
    if key == "addon" {
        return handle_addon(message.value().unwrap_or(""), facts, tables);
    }
    if key == "demand" {
        return handle_demand(message.value().unwrap_or(""), facts);
    }

    // Only the upstream and full-access clients may write beyond this
    // point. addon= is handled above because FRDP AUTH must get through
    // for clients that have no access yet.
    if !facts.source.is_upstream() && !facts.can_write {
        return Decision::drop(RouteCode::NoWrite);
    }

    match message {
        Message::Signal(name) => handle_signal(name, facts, tables),
        Message::KeyValue { key, value } => {
            handle_key_value(key, value, facts, tables, filters, catalogue)
        }
    }
}

fn handle_name(value: &str, facts: &SenderFacts) -> Decision {
    if value.is_empty() {
        return Decision::invalid("name keyword without value");
    }

    // Another router identifying itself on this connection.
    if value.contains(PEER_NAME_SIGNATURE) {
        let display_name = truncate_name(value.split(':').next().unwrap_or(value));
        return Decision::drop(RouteCode::NameFromPeer)
            .with_event(RuleEvent::PeerName { display_name });
    }

    if facts.source.is_upstream() || facts.is_peer_router {
        // Names arriving over a router connection describe multiplexed
        // clients, not the connection itself.
        return Decision::drop(RouteCode::NameLearned)
            .with_note("ignoring name keyword from router connection");
    }

    let (provided_id, provided_name) = match value.split_once(':') {
        Some((id, name)) => (
            (!id.is_empty()).then(|| id.to_string()),
            Some(name.to_string()),
        ),
        None => (None, Some(value.to_string())),
    };
    let display_name = truncate_name(&cleaned_display_name(value));

    // The name travels to the upstream and to peer routers so it
    // propagates network-wide.
    let mut decision = Decision::new(
        RouteAction::Restricted(EgressScope::PeersOnly),
        RouteCode::NameLearned,
    )
    .with_event(RuleEvent::NameLearned {
        display_name,
        provided_id,
        provided_name,
    });
    if !facts.can_write {
        // Observers still get their identity learned; it just stays local.
        decision.action = RouteAction::Drop;
    }
    decision
}

/// The community convention is `name=SHORTNAME:LONGNAME`; well-known
/// addons get a cleaner short name.
fn cleaned_display_name(value: &str) -> String {
    let first = |v: &str| v.split(':').next().unwrap_or(v).to_string();
    if value.contains("PSX.NET EFB") {
        first(value)
    } else if value == ":PSX Sounds" {
        "PSX Sounds".to_string()
    } else if value.starts_with("MSFS Router") {
        "MSFS Router".to_string()
    } else if value.starts_with("BACARS:") {
        "BACARS".to_string()
    } else if value.starts_with("VPLG:") {
        "vPilot".to_string()
    } else if value.contains("FRANKEN.PY") {
        first(value)
    } else {
        value.to_string()
    }
}

fn truncate_name(name: &str) -> String {
    name.chars().take(DISPLAY_NAME_MAXLEN).collect()
}

fn handle_addon(value: &str, facts: &SenderFacts, tables: &RuleTables) -> Decision {
    match frdp::parse_addon_value(value) {
        FrdpParse::NotFrdp => {
            // Foreign addon chatter is forwarded for writers and dropped
            // for everyone else.
            if facts.source.is_upstream() || facts.can_write {
                Decision::new(RouteAction::Normal, RouteCode::AddonForwarded)
            } else {
                Decision::drop(RouteCode::NoWrite)
            }
        }
        FrdpParse::Invalid(note) => Decision::invalid(note),
        FrdpParse::Message { version, message } => {
            let mut decision = handle_frdp(message, version, facts);
            if version != FRDP_VERSION {
                decision.note = Some(format!(
                    "peer speaks FRDP version {version}, we speak {FRDP_VERSION}"
                ));
            }
            decision
        }
    }
}

fn handle_frdp(message: FrdpMessage, version: u32, facts: &SenderFacts) -> Decision {
    match message {
        FrdpMessage::Ping { id } => {
            // Echo the nonce; receiving a PING marks the sender as a
            // router.
            let reply = FrdpMessage::Pong { id }.to_line(FRDP_VERSION);
            Decision::drop(RouteCode::FrdpPing)
                .with_reply(reply)
                .with_event(RuleEvent::MarkPeer)
        }
        FrdpMessage::Pong { id } => {
            if facts.expected_ping_id != Some(id.as_str()) {
                return Decision::invalid(format!(
                    "unexpected PONG id {id}, expected {:?}",
                    facts.expected_ping_id
                ));
            }
            Decision::drop(RouteCode::FrdpPong).with_event(RuleEvent::PongReceived { id })
        }
        FrdpMessage::Ident {
            simulator,
            router,
            uuid,
        } => Decision::drop(RouteCode::FrdpIdent).with_event(RuleEvent::Ident {
            simulator,
            router,
            uuid,
            version,
        }),
        FrdpMessage::Auth { password } => {
            if facts.source.is_upstream() {
                return Decision::invalid("FRDP AUTH from upstream");
            }
            Decision::drop(RouteCode::FrdpAuth).with_event(RuleEvent::Auth { password })
        }
        FrdpMessage::Bang => Decision::new(RouteAction::Normal, RouteCode::FrdpBang)
            .with_event(RuleEvent::NoteBang),
        FrdpMessage::RouterInfo { json } => {
            match serde_json::from_str::<serde_json::Value>(&json) {
                Ok(parsed) if parsed.get("uuid").is_some() => {
                    Decision::new(RouteAction::Normal, RouteCode::FrdpRouterInfo)
                        .with_event(RuleEvent::RouterInfo { json })
                }
                Ok(_) => Decision::invalid("ROUTERINFO without uuid"),
                Err(e) => Decision::invalid(format!("invalid JSON in ROUTERINFO: {e}")),
            }
        }
        FrdpMessage::ClientInfo { json } => {
            if facts.source.is_upstream() {
                return Decision::invalid("FRDP CLIENTINFO from upstream");
            }
            match serde_json::from_str::<serde_json::Value>(&json) {
                // One-hop: applied here, never forwarded.
                Ok(_) => {
                    Decision::drop(RouteCode::FrdpClientInfo)
                        .with_event(RuleEvent::ClientInfo { json })
                }
                Err(e) => Decision::invalid(format!("invalid JSON in CLIENTINFO: {e}")),
            }
        }
        FrdpMessage::SharedInfo { json } => {
            match serde_json::from_str::<serde_json::Value>(&json) {
                Ok(_) => Decision::new(RouteAction::Normal, RouteCode::FrdpSharedInfo)
                    .with_event(RuleEvent::SharedInfo { json }),
                Err(e) => Decision::invalid(format!("invalid JSON in SHAREDINFO: {e}")),
            }
        }
    }
}

fn handle_demand(value: &str, facts: &SenderFacts) -> Decision {
    if facts.source.is_upstream() {
        return Decision::invalid("demand from upstream");
    }
    if value.is_empty() {
        return Decision::invalid("demand without keyword");
    }
    Decision::new(RouteAction::UpstreamOnly, RouteCode::Demand).with_event(RuleEvent::Demand {
        keyword: value.to_string(),
    })
}

fn handle_signal(name: &str, facts: &SenderFacts, tables: &RuleTables) -> Decision {
    let from_upstream = facts.source.is_upstream();
    match name {
        "load1" => Decision::new(RouteAction::Normal, RouteCode::Load1),
        "load2" => Decision::new(RouteAction::Normal, RouteCode::Load2),
        "load3" => Decision::new(RouteAction::Normal, RouteCode::Load3),
        "again" => {
            if from_upstream {
                Decision::invalid("again from upstream")
            } else {
                Decision::new(RouteAction::UpstreamOnly, RouteCode::Again)
            }
        }
        "start" => {
            if from_upstream {
                Decision::invalid("start from upstream")
            } else {
                Decision::new(RouteAction::UpstreamOnly, RouteCode::Start)
                    .with_event(RuleEvent::StartSent)
            }
        }
        "bang" => {
            if from_upstream {
                Decision::invalid("bang from upstream")
            } else {
                // Answered from the cache; the upstream is not involved.
                Decision::drop(RouteCode::Bang).with_event(RuleEvent::BangReplay)
            }
        }
        "exit" => Decision::drop(RouteCode::Exit).with_event(RuleEvent::CloseSession),
        "nolong" => {
            if from_upstream {
                Decision::invalid("nolong from upstream")
            } else {
                Decision::drop(RouteCode::Nolong).with_event(RuleEvent::ToggleNolong)
            }
        }
        "pleaseBeSoKindAndQuit" => handle_quit(facts, tables),
        _ => Decision::drop(RouteCode::FallbackRule)
            .with_note(format!("unhandled signal {name}")),
    }
}

/// Quit and layout commands from a router serving a different simulator
/// must not affect us.
fn crosses_simulators(facts: &SenderFacts, tables: &RuleTables) -> bool {
    facts.is_peer_router
        && facts
            .simulator_name
            .is_some_and(|sim| sim != tables.our_simulator)
}

fn handle_quit(facts: &SenderFacts, tables: &RuleTables) -> Decision {
    if crosses_simulators(facts, tables) {
        return Decision::drop(RouteCode::Quit)
            .with_note("dropping quit command from another simulator");
    }
    if facts.source.is_upstream() || tables.forward_quit_upstream {
        Decision::new(RouteAction::Normal, RouteCode::Quit)
    } else {
        Decision::new(
            RouteAction::Restricted(EgressScope::ClientsOnly),
            RouteCode::Quit,
        )
    }
}

fn handle_key_value(
    key: &str,
    value: &str,
    facts: &SenderFacts,
    tables: &RuleTables,
    filters: FilterSnapshot,
    catalogue: &VariableCatalogue,
) -> Decision {
    let from_upstream = facts.source.is_upstream();

    // Handshake and lexicon keys from the upstream are replayed only in
    // welcomes, never forwarded as they arrive.
    if from_upstream
        && (matches!(key, "id" | "version" | "layout" | "metar")
            || key.starts_with("Ls")
            || key.starts_with("Lh")
            || key.starts_with("Li"))
    {
        return Decision::drop(RouteCode::CachedOnly).with_cache(key, value);
    }

    if key == "layout" && crosses_simulators(facts, tables) {
        return Decision::drop(RouteCode::Layout)
            .with_note("dropping layout command from another simulator");
    }

    if !catalogue.is_psx_keyword(key) {
        return match tables.unknown_policy {
            UnknownKeywordPolicy::Log => {
                Decision::new(RouteAction::Normal, RouteCode::NonPsx).with_cache(key, value)
            }
            UnknownKeywordPolicy::Drop => {
                Decision::drop(RouteCode::NonPsx).with_note(format!("unknown keyword {key}"))
            }
        };
    }

    // Ingress guard: BACARS prints junk through Qs119 right after it
    // starts.
    if !from_upstream
        && key == "Qs119"
        && facts.seconds_since_connect < BACARS_GUARD_SECS
        && facts.display_name.contains("BACARS")
    {
        return Decision::drop(RouteCode::KeyValueFilteredIngress)
            .with_note("filtered Qs119 from BACARS shortly after connection");
    }

    // Egress filters on injected data from the upstream. A filtered
    // keyword is withheld from ordinary clients and the cache keeps its
    // previous value; peer routers are exempt and still receive it.
    if from_upstream {
        let hit = if filters.elevation && tables.elevation_keywords.contains(key) {
            Some(FilterHit::Elevation)
        } else if filters.traffic && tables.traffic_keywords.contains(key) {
            Some(FilterHit::Traffic)
        } else if filters.flight_controls && tables.flight_control_keywords.contains(key) {
            Some(FilterHit::FlightControls)
        } else {
            None
        };
        if let Some(hit) = hit {
            let mut decision = Decision::new(
                RouteAction::Restricted(EgressScope::PeersOnly),
                RouteCode::KeyValueFilteredEgress,
            );
            decision.filter_hit = Some(hit);
            return decision;
        }
    }

    let cacheable = !catalogue.is_pure_delta(key);

    // Long string variables go only to clients that want them.
    if tables.nolong_keywords.contains(key) {
        let mut decision = Decision::new(
            RouteAction::Restricted(EgressScope::SkipNolong),
            RouteCode::KeyValueNormal,
        );
        if cacheable {
            decision = decision.with_cache(key, value);
        }
        return decision;
    }

    // Pure-START keywords reach peer routers at all times and other
    // clients only inside their welcome window.
    if catalogue.is_pure_start(key) {
        let mut decision = Decision::new(
            RouteAction::Restricted(EgressScope::StartOnly {
                key: key.to_string(),
            }),
            RouteCode::KeyValueNormal,
        );
        if cacheable {
            decision = decision.with_cache(key, value);
        }
        return decision;
    }

    // Qi191 makes PSX Sounds play its gear-pin sound; hold it back right
    // after a bang. Data answering a bang can only come from upstream.
    if from_upstream
        && key == "Qi191"
        && facts.seconds_since_bang.is_some_and(|s| s < BANG_GUARD_SECS)
    {
        let mut decision = Decision::new(
            RouteAction::Restricted(EgressScope::SkipNameMatching("PSX Sound")),
            RouteCode::KeyValueNormal,
        );
        if cacheable {
            decision = decision.with_cache(key, value);
        }
        return decision;
    }

    let mut decision = Decision::new(RouteAction::Normal, RouteCode::KeyValueNormal);
    if cacheable {
        decision = decision.with_cache(key, value);
    }
    decision
}
