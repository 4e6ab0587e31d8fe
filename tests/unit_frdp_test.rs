use frankenrouter::core::frdp::{
    parse_addon_value, ConnectionInfo, FilterInfo, FrdpMessage, FrdpParse, RouterInfoPayload,
    FRDP_VERSION,
};

#[test]
fn all_message_types_roundtrip() {
    let messages = [
        FrdpMessage::Auth {
            password: "s3cret".into(),
        },
        FrdpMessage::Ident {
            simulator: "FrankenSim".into(),
            router: "router1".into(),
            uuid: "11111111-2222-3333-4444-555555555555".into(),
        },
        FrdpMessage::Ping { id: "abcDEF123".into() },
        FrdpMessage::Pong { id: "abcDEF123".into() },
        FrdpMessage::RouterInfo {
            json: r#"{"uuid":"x"}"#.into(),
        },
        FrdpMessage::ClientInfo {
            json: r#"{"laddr":"127.0.0.1","lport":1,"name":"n"}"#.into(),
        },
        FrdpMessage::SharedInfo {
            json: r#"{"uuid":"x","seats":{}}"#.into(),
        },
    ];
    for message in messages {
        let line = message.to_line(FRDP_VERSION);
        let value = line.strip_prefix("addon=").unwrap();
        match parse_addon_value(value) {
            FrdpParse::Message {
                version,
                message: parsed,
            } => {
                assert_eq!(version, FRDP_VERSION);
                assert_eq!(parsed, message);
            }
            other => panic!("failed to parse {line}: {other:?}"),
        }
    }
}

#[test]
fn bang_has_no_payload() {
    let line = FrdpMessage::Bang.to_line(FRDP_VERSION);
    assert_eq!(line, "addon=FRANKENROUTER:2:BANG");
    let parsed = parse_addon_value("FRANKENROUTER:2:BANG");
    assert_eq!(
        parsed,
        FrdpParse::Message {
            version: 2,
            message: FrdpMessage::Bang
        }
    );
}

#[test]
fn ident_payload_with_missing_fields_is_invalid() {
    assert!(matches!(
        parse_addon_value("FRANKENROUTER:2:IDENT:OnlySim"),
        FrdpParse::Invalid(_)
    ));
}

#[test]
fn unknown_type_is_invalid_not_a_crash() {
    assert!(matches!(
        parse_addon_value("FRANKENROUTER:2:SELFDESTRUCT:now"),
        FrdpParse::Invalid(_)
    ));
}

#[test]
fn foreign_addons_are_not_frdp() {
    assert_eq!(parse_addon_value("VPILOT:whatever"), FrdpParse::NotFrdp);
    assert_eq!(parse_addon_value(""), FrdpParse::NotFrdp);
}

#[test]
fn future_version_still_parses() {
    // A peer speaking a newer protocol version: the message must parse so
    // the router can log the mismatch and carry on.
    match parse_addon_value("FRANKENROUTER:9:PING:nonce") {
        FrdpParse::Message { version, message } => {
            assert_eq!(version, 9);
            assert_eq!(message, FrdpMessage::Ping { id: "nonce".into() });
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn routerinfo_payload_serializes_with_expected_keys() {
    let payload = RouterInfoPayload {
        router_name: "router1".into(),
        simulator_name: "FrankenSim".into(),
        uuid: "abc".into(),
        uptime: 3600,
        filters: FilterInfo {
            elevation: true,
            traffic: false,
            flight_controls: true,
        },
        connections: vec![ConnectionInfo {
            id: 3,
            display_name: "PSX Sounds".into(),
            ip: "192.168.42.9".into(),
            port: 51234,
            is_router: false,
        }],
    };
    let json = serde_json::to_string(&payload).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["uuid"], "abc");
    assert_eq!(value["uptime"], 3600);
    assert_eq!(value["filters"]["elevation"], true);
    assert_eq!(value["connections"][0]["display_name"], "PSX Sounds");

    // And back.
    let parsed: RouterInfoPayload = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.connections.len(), 1);
}

#[test]
fn payload_with_colons_survives() {
    // JSON payloads contain colons; only the first two separate fields.
    let parsed = parse_addon_value(r#"FRANKENROUTER:2:ROUTERINFO:{"uuid":"a:b:c"}"#);
    match parsed {
        FrdpParse::Message { message, .. } => {
            assert_eq!(
                message,
                FrdpMessage::RouterInfo {
                    json: r#"{"uuid":"a:b:c"}"#.into()
                }
            );
        }
        other => panic!("unexpected {other:?}"),
    }
}
