//! End-to-end test over a real TCP socket: accept, welcome, route, exit.

use frankenrouter::config::{AccessConfig, Config};
use frankenrouter::connection::ClientHandler;
use frankenrouter::core::access::AccessLevel;
use frankenrouter::core::catalogue::VariableCatalogue;
use frankenrouter::core::router::Engine;
use frankenrouter::core::state::RouterState;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

const CATALOGUE: &str = r#"
Qs121="PiBaHeAlTas"; Mode=ECON; Min=10; Max=200;
Qi17="SomeVar"; Mode=ECON; Min=0; Max=99;
"#;

fn open_config() -> Config {
    let mut config = Config::default();
    config.access = vec![AccessConfig {
        display_name: "test client".to_string(),
        match_ipv4: vec!["ANY".to_string()],
        match_password: None,
        level: AccessLevel::Full,
    }];
    config
}

async fn read_lines_until(
    stream: &mut TcpStream,
    stop: &str,
) -> Vec<String> {
    let mut collected = String::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert!(n > 0, "connection closed before '{stop}' was seen");
        collected.push_str(&String::from_utf8_lossy(&buf[..n]));
        if collected
            .split("\r\n")
            .any(|line| line == stop)
        {
            break;
        }
    }
    collected
        .split("\r\n")
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect()
}

#[tokio::test]
async fn client_gets_welcome_and_exit_over_tcp() {
    let catalogue = VariableCatalogue::from_data(CATALOGUE).unwrap();
    let init = RouterState::initialize(open_config(), catalogue).unwrap();
    let engine = Engine::new(init.state.clone());

    // Seed the cache as an upstream would have.
    engine.handle_upstream_line("version=10.184").await;
    engine.handle_upstream_line("Qs121=hello").await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);

    let accept_engine = engine.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let (socket, addr) = listener.accept().await.unwrap();
        let (handler, reader) = ClientHandler::new(accept_engine, socket, addr, shutdown_rx);
        handler.run(reader).await;
    });

    let mut stream = TcpStream::connect(local_addr).await.unwrap();

    // The welcome arrives unprompted, terminated by the router's identity
    // line.
    let lines = read_lines_until(
        &mut stream,
        "name=UnknownSim:FRANKEN.PY frankenrouter PSX router UnknownRouter",
    )
    .await;
    assert_eq!(lines[0], "id=1");
    assert!(lines.contains(&"version=10.184".to_string()));
    assert!(lines.contains(&"load1".to_string()));
    assert!(lines.contains(&"Qs121=hello".to_string()));
    assert!(lines.contains(&"load3".to_string()));
    assert_eq!(init.state.clients.len(), 1);

    // A variable update lands in the cache; bare LF is accepted on ingest.
    stream.write_all(b"Qi17=55\n").await.unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if engine.state.cache.lock().await.get("Qi17") == Some("55") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("update never reached the cache");

    // exit is acknowledged and the connection is closed.
    stream.write_all(b"exit\r\n").await.unwrap();
    let lines = read_lines_until(&mut stream, "exit").await;
    assert!(lines.contains(&"exit".to_string()));

    // The session disappears from the client table.
    timeout(Duration::from_secs(5), async {
        loop {
            if init.state.clients.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session was never cleaned up");
}
