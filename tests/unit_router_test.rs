//! Engine-level scenario tests: synthesised welcomes, filtering, access,
//! and the pending-message invariant, exercised against a real
//! `RouterState` with in-memory client queues standing in for sockets.

use frankenrouter::config::{AccessConfig, Config};
use frankenrouter::connection::session::{AccessState, ClientSession};
use frankenrouter::core::access::AccessLevel;
use frankenrouter::core::catalogue::VariableCatalogue;
use frankenrouter::core::router::{Engine, LineOutcome};
use frankenrouter::core::state::{ClientHandle, RouterState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{broadcast, mpsc};

const CATALOGUE: &str = r#"
Qs121="PiBaHeAlTas"; Mode=ECON; Min=10; Max=200;
Qi198="GroundElev"; Mode=ECON; Min=-1000; Max=100000;
Qi17="SomeVar"; Mode=ECON; Min=0; Max=99;
Qi214="StartOnlyVar"; Mode=START; Min=0; Max=2;
Qs468="FansDnResp"; Mode=DELTA; Min=0; Max=500;
"#;

fn make_engine(config: Config) -> Engine {
    let catalogue = VariableCatalogue::from_data(CATALOGUE).unwrap();
    let init = RouterState::initialize(config, catalogue).unwrap();
    Engine::new(init.state)
}

/// Registers a fake client whose outbound queue we can inspect.
async fn make_client(
    engine: &Engine,
    addr: &str,
    level: AccessLevel,
    welcomed: bool,
) -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<String>) {
    let addr: SocketAddr = addr.parse().unwrap();
    let id = engine.state.allocate_client_id();
    let (tx, rx) = mpsc::unbounded_channel();
    let (kill_tx, _) = broadcast::channel(1);
    let mut session = ClientSession::new();
    session.access = AccessState::Granted(level);
    session.welcome_sent = welcomed;
    let client = Arc::new(ClientHandle::new(id, addr, tx, kill_tx, session));
    engine.state.clients.insert(id, client.clone());
    (client, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}

// Scenario: welcome replay. The upstream has populated the cache; a new
// client receives a complete synthesised welcome in catalogue order, with
// a router-assigned id and no layout line (it was never cached).
#[tokio::test]
async fn welcome_replay_from_cache() {
    let engine = make_engine(Config::default());

    for line in [
        "id=42",
        "version=10.184",
        "Qs121=hello",
        "Qi198=0",
        "load1",
        "load2",
        "load3",
        "metar=XXXX",
    ] {
        assert_eq!(
            engine.handle_upstream_line(line).await,
            LineOutcome::Continue
        );
    }

    let (client, mut rx) = make_client(&engine, "127.0.0.1:4000", AccessLevel::Full, false).await;
    engine.welcome_client(&client).await;

    let lines = drain(&mut rx);
    assert_eq!(
        lines,
        vec![
            format!("id={}", client.id),
            "version=10.184".to_string(),
            "load1".to_string(),
            "Qs121=hello".to_string(),
            "Qi198=0".to_string(),
            "load2".to_string(),
            "load3".to_string(),
            "metar=XXXX".to_string(),
            "name=UnknownSim:FRANKEN.PY frankenrouter PSX router UnknownRouter".to_string(),
        ]
    );
    assert!(client.session.lock().await.welcome_sent);
}

// With an empty cache the welcome still carries a plausible version line.
#[tokio::test]
async fn welcome_fabricates_version_when_cache_is_cold() {
    let engine = make_engine(Config::default());
    let (client, mut rx) = make_client(&engine, "127.0.0.1:4001", AccessLevel::Full, false).await;
    engine.welcome_client(&client).await;

    let lines = drain(&mut rx);
    assert_eq!(lines[0], format!("id={}", client.id));
    assert_eq!(lines[1], "version=10.182 NG");
    assert!(lines.contains(&"load1".to_string()));
    assert!(lines.contains(&"load3".to_string()));
    // Nothing resembling a layout or metar line.
    assert!(!lines.iter().any(|l| l.starts_with("layout=")));
    assert!(!lines.iter().any(|l| l.starts_with("metar=")));
}

// The pending-message invariant: nothing rule 3 would forward reaches a
// client before its welcome completes; it is queued and drained after.
#[tokio::test]
async fn messages_before_welcome_are_held() {
    let engine = make_engine(Config::default());
    let (client, mut rx) = make_client(&engine, "127.0.0.1:4002", AccessLevel::Full, false).await;

    engine.handle_upstream_line("Qi17=5").await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(
        client.session.lock().await.pending_messages,
        vec!["Qi17=5".to_string()]
    );

    engine.welcome_client(&client).await;
    let lines = drain(&mut rx);
    // The held line is delivered right after the welcome body, before the
    // router's identity line.
    let qi17_positions: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.as_str() == "Qi17=5")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(qi17_positions.len(), 2, "welcome replay plus held copy");
    assert!(client.session.lock().await.pending_messages.is_empty());
}

// Scenario: filter. With the elevation filter on, Qi198 from upstream
// reaches no ordinary client and the counter moves; peer routers are
// exempt; disabled again, it flows everywhere.
#[tokio::test]
async fn elevation_filter_toggle() {
    let engine = make_engine(Config::default());
    let (_client, mut rx) = make_client(&engine, "127.0.0.1:4003", AccessLevel::Full, true).await;
    let (peer, mut peer_rx) = make_client(&engine, "127.0.0.1:4022", AccessLevel::Full, true).await;
    peer.session.lock().await.is_peer_router = true;

    engine
        .state
        .filters
        .elevation
        .store(true, Ordering::Relaxed);
    engine.handle_upstream_line("Qi198=123").await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(drain(&mut peer_rx), vec!["Qi198=123".to_string()]);
    assert_eq!(
        engine.state.stats.filtered_elevation.load(Ordering::Relaxed),
        1
    );
    // Filter wins over cache: the old value is untouched.
    assert_eq!(engine.state.cache.lock().await.get("Qi198"), None);

    engine
        .state
        .filters
        .elevation
        .store(false, Ordering::Relaxed);
    engine.handle_upstream_line("Qi198=124").await;
    assert_eq!(drain(&mut rx), vec!["Qi198=124".to_string()]);
    assert_eq!(drain(&mut peer_rx), vec!["Qi198=124".to_string()]);
}

// Observer clients receive everything but their writes vanish.
#[tokio::test]
async fn observer_writes_are_counted_and_dropped() {
    let engine = make_engine(Config::default());
    let (observer, _obs_rx) =
        make_client(&engine, "127.0.0.1:4004", AccessLevel::Observer, true).await;
    let (_full, mut full_rx) = make_client(&engine, "127.0.0.1:4005", AccessLevel::Full, true).await;

    engine.handle_client_line(&observer, "Qi17=99").await;
    assert!(drain(&mut full_rx).is_empty());
    assert_eq!(
        engine
            .state
            .stats
            .observer_writes_dropped
            .load(Ordering::Relaxed),
        1
    );

    // demand= is the observer's one allowed write.
    engine.handle_client_line(&observer, "demand=Qs480").await;
    assert!(observer.session.lock().await.demands.contains("Qs480"));
}

// Scenario: demand replay. The demand reaches the (disconnected) upstream
// buffer so a reconnect can replay it.
#[tokio::test]
async fn demand_is_buffered_for_upstream() {
    let engine = make_engine(Config::default());
    let (client, _rx) = make_client(&engine, "127.0.0.1:4006", AccessLevel::Full, true).await;

    engine.handle_client_line(&client, "demand=Qs325").await;
    assert!(client.session.lock().await.demands.contains("Qs325"));
    let pending = engine.state.upstream.take_pending().await;
    assert_eq!(pending, vec!["demand=Qs325".to_string()]);
}

// A client's variable update goes to the upstream and the other clients,
// but never back to the sender.
#[tokio::test]
async fn client_updates_fan_out_except_sender() {
    let engine = make_engine(Config::default());
    let (sender, mut sender_rx) =
        make_client(&engine, "127.0.0.1:4007", AccessLevel::Full, true).await;
    let (_other, mut other_rx) =
        make_client(&engine, "127.0.0.1:4008", AccessLevel::Full, true).await;

    engine.handle_client_line(&sender, "Qi17=42").await;
    assert!(drain(&mut sender_rx).is_empty());
    assert_eq!(drain(&mut other_rx), vec!["Qi17=42".to_string()]);
    assert_eq!(engine.state.cache.lock().await.get("Qi17"), Some("42"));
    assert_eq!(
        engine.state.upstream.take_pending().await,
        vec!["Qi17=42".to_string()]
    );
}

// bang is answered from the cache, in catalogue order, pure-DELTA
// excluded, and is not forwarded anywhere.
#[tokio::test]
async fn bang_replays_cache_in_catalogue_order() {
    let engine = make_engine(Config::default());
    {
        let mut cache = engine.state.cache.lock().await;
        cache.put("Qi17", "3");
        cache.put("Qs121", "hello");
        cache.put("Qi198", "42");
    }
    let (client, mut rx) = make_client(&engine, "127.0.0.1:4009", AccessLevel::Full, true).await;
    let (_other, mut other_rx) =
        make_client(&engine, "127.0.0.1:4010", AccessLevel::Full, true).await;

    engine.handle_client_line(&client, "bang").await;
    assert_eq!(
        drain(&mut rx),
        vec![
            "Qs121=hello".to_string(),
            "Qi198=42".to_string(),
            "Qi17=3".to_string(),
        ]
    );
    assert!(drain(&mut other_rx).is_empty());
    assert!(engine.state.upstream.take_pending().await.is_empty());
}

// Pure-START keywords reach peer routers at all times and ordinary
// welcomed clients never (outside their welcome window).
#[tokio::test]
async fn pure_start_keywords_go_to_peers_only() {
    let engine = make_engine(Config::default());
    let (peer, mut peer_rx) = make_client(&engine, "127.0.0.1:4011", AccessLevel::Full, true).await;
    peer.session.lock().await.is_peer_router = true;
    let (_normal, mut normal_rx) =
        make_client(&engine, "127.0.0.1:4012", AccessLevel::Full, true).await;

    engine.handle_upstream_line("Qi214=7").await;
    assert_eq!(drain(&mut peer_rx), vec!["Qi214=7".to_string()]);
    assert!(drain(&mut normal_rx).is_empty());
    // Cached all the same, for later welcomes.
    assert_eq!(engine.state.cache.lock().await.get("Qi214"), Some("7"));
}

// FRDP PING from a client: PONG comes back, nothing is forwarded, and the
// sender is now known to be a router.
#[tokio::test]
async fn frdp_ping_marks_peer_and_replies() {
    let engine = make_engine(Config::default());
    let (client, mut rx) = make_client(&engine, "127.0.0.1:4013", AccessLevel::Full, true).await;
    let (_other, mut other_rx) =
        make_client(&engine, "127.0.0.1:4014", AccessLevel::Full, true).await;

    engine
        .handle_client_line(&client, "addon=FRANKENROUTER:2:PING:xyz")
        .await;
    assert_eq!(drain(&mut rx), vec!["addon=FRANKENROUTER:2:PONG:xyz".to_string()]);
    assert!(drain(&mut other_rx).is_empty());
    assert!(client.session.lock().await.is_peer_router);
}

// ROUTERINFO is stored by uuid and forwarded across the network.
#[tokio::test]
async fn routerinfo_is_stored_and_forwarded() {
    let engine = make_engine(Config::default());
    let (client, _rx) = make_client(&engine, "127.0.0.1:4015", AccessLevel::Full, true).await;
    let (_other, mut other_rx) =
        make_client(&engine, "127.0.0.1:4016", AccessLevel::Full, true).await;

    let line = r#"addon=FRANKENROUTER:2:ROUTERINFO:{"uuid":"peer-uuid","router_name":"r2"}"#;
    engine.handle_client_line(&client, line).await;
    assert!(engine.state.frdp.routerinfo.contains_key("peer-uuid"));
    assert_eq!(drain(&mut other_rx), vec![line.to_string()]);
}

// Scenario: access. A password-guarded rule parks the connection until
// FRDP AUTH arrives with the right password.
#[tokio::test]
async fn frdp_auth_grants_access_and_triggers_welcome() {
    let mut config = Config::default();
    config.access = vec![AccessConfig {
        display_name: "secret door".to_string(),
        match_ipv4: vec!["127.0.0.1/32".to_string()],
        match_password: Some("s3cret".to_string()),
        level: AccessLevel::Full,
    }];
    let engine = make_engine(config);

    let (client, mut rx) = make_client(&engine, "127.0.0.1:4017", AccessLevel::Full, false).await;
    client.session.lock().await.access = AccessState::Pending;

    // Wrong password: unauthorized and closed.
    let outcome = engine
        .handle_client_line(&client, "addon=FRANKENROUTER:2:AUTH:nope")
        .await;
    assert_eq!(outcome, LineOutcome::Close);
    assert_eq!(drain(&mut rx), vec!["unauthorized".to_string()]);

    // Right password: access granted and the welcome begins.
    client.session.lock().await.access = AccessState::Pending;
    let outcome = engine
        .handle_client_line(&client, "addon=FRANKENROUTER:2:AUTH:s3cret")
        .await;
    assert_eq!(outcome, LineOutcome::Continue);
    {
        let session = client.session.lock().await;
        assert_eq!(session.access, AccessState::Granted(AccessLevel::Full));
        assert!(session.welcome_sent);
        assert_eq!(session.display_name, "secret door");
    }
    let lines = drain(&mut rx);
    assert_eq!(lines[0], format!("id={}", client.id));
}

// exit: the reply is sent, the session is told to close.
#[tokio::test]
async fn exit_is_acknowledged_and_closes() {
    let engine = make_engine(Config::default());
    let (client, mut rx) = make_client(&engine, "127.0.0.1:4018", AccessLevel::Full, true).await;
    let mut kill_rx = client.kill.subscribe();

    let outcome = engine.handle_client_line(&client, "exit").await;
    assert_eq!(outcome, LineOutcome::Close);
    assert_eq!(drain(&mut rx), vec!["exit".to_string()]);
    assert!(kill_rx.try_recv().is_ok());
}

// A name line teaches the router the client's identity and travels to
// peers (and the upstream), never to ordinary clients.
#[tokio::test]
async fn name_propagates_to_peers_only() {
    let engine = make_engine(Config::default());
    let (sender, _rx) = make_client(&engine, "127.0.0.1:4019", AccessLevel::Full, true).await;
    let (peer, mut peer_rx) = make_client(&engine, "127.0.0.1:4020", AccessLevel::Full, true).await;
    peer.session.lock().await.is_peer_router = true;
    let (_plain, mut plain_rx) =
        make_client(&engine, "127.0.0.1:4021", AccessLevel::Full, true).await;

    engine
        .handle_client_line(&sender, "name=EFB1:PSX.NET EFB For Windows")
        .await;
    {
        let session = sender.session.lock().await;
        assert_eq!(session.display_name, "EFB1");
        assert_eq!(session.client_provided_id.as_deref(), Some("EFB1"));
        assert_eq!(
            session.client_provided_display_name.as_deref(),
            Some("PSX.NET EFB For Windows")
        );
    }
    assert_eq!(
        drain(&mut peer_rx),
        vec!["name=EFB1:PSX.NET EFB For Windows".to_string()]
    );
    assert!(drain(&mut plain_rx).is_empty());
    assert_eq!(
        engine.state.upstream.take_pending().await,
        vec!["name=EFB1:PSX.NET EFB For Windows".to_string()]
    );
}

// Upstream switchover: the target is replaced atomically and the
// reconnect loop is woken.
#[tokio::test]
async fn switchover_replaces_target_and_signals() {
    let engine = make_engine(Config::default());
    let mut reconfigure_rx = engine.state.upstream.reconfigure_tx.subscribe();

    let target = frankenrouter::core::state::UpstreamTarget {
        name: "new".to_string(),
        host: "localhost".to_string(),
        port: 20748,
        password: None,
    };
    engine.state.upstream.switch_target(target.clone()).await;

    assert_eq!(*engine.state.upstream.target.lock().await, target);
    assert!(reconfigure_rx.try_recv().is_ok());
}
