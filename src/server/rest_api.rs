// src/server/rest_api.rs

//! The HTTP/REST control surface. Every mutating endpoint takes effect on
//! the running router without a restart.

use crate::core::router::{BroadcastOpts, Engine};
use crate::core::state::UpstreamTarget;
use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::time::UNIX_EPOCH;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Runs the REST API server until shutdown.
pub async fn run_rest_api(engine: Engine, port: u16, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/clients", get(get_clients))
        .route("/api/disconnect", post(post_disconnect))
        .route("/api/routerinfo", get(get_routerinfo))
        .route("/api/sharedinfo", get(get_sharedinfo))
        .route("/api/upstream", get(get_upstream).post(post_upstream))
        .route("/api/filter/{filter}/{action}", get(get_filter_toggle))
        .route("/api/blocklist", get(get_blocklist))
        .route("/api/blocklist/add", post(post_blocklist_add))
        .route("/api/blocklist/remove", post(post_blocklist_remove))
        .route("/api/vpilotprint/message", post(post_vpilotprint))
        .with_state(engine);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("REST API listening on http://{addr}/api");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind REST API on port {port}: {e}");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("REST API shutting down.");
        })
        .await
    {
        error!("REST API server error: {e}");
    }
}

/// Queue depths, write-time statistics, and the router counters.
async fn get_stats(State(engine): State<Engine>) -> impl IntoResponse {
    let state = &engine.state;

    let mut queue_depths = serde_json::Map::new();
    let mut samples: Vec<f64> = state.upstream.counters.write_time_samples();
    for entry in state.clients.iter() {
        let client = entry.value();
        queue_depths.insert(
            client.id.to_string(),
            json!(client.counters.queued_bytes.load(Ordering::Relaxed)),
        );
        samples.extend(client.counters.write_time_samples());
    }

    let write_time = write_time_statistics(&mut samples);
    Json(json!({
        "uptime": state.uptime_secs(),
        "queue_depths": queue_depths,
        "write_time_ms": write_time,
        "counters": state.stats.snapshot(),
        "traffic_log_dropped": state.traffic_log.dropped.load(Ordering::Relaxed),
        "cache_keywords": state.cache.lock().await.len(),
    }))
}

/// max/median/mean/stdev over the pooled write-time samples, in
/// milliseconds.
fn write_time_statistics(samples: &mut [f64]) -> serde_json::Value {
    if samples.is_empty() {
        return json!(null);
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = samples.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 0 {
        (samples[n / 2 - 1] + samples[n / 2]) / 2.0
    } else {
        samples[n / 2]
    };
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
    json!({
        "max": samples[n - 1] * 1000.0,
        "median": median * 1000.0,
        "mean": mean * 1000.0,
        "stdev": variance.sqrt() * 1000.0,
    })
}

async fn get_clients(State(engine): State<Engine>) -> impl IntoResponse {
    let mut clients = Vec::new();
    for entry in engine.state.clients.iter() {
        let client = entry.value();
        let session = client.session.lock().await;
        clients.push(json!({
            "id": client.id,
            "ip": client.addr.ip().to_string(),
            "port": client.addr.port(),
            "display_name": session.display_name,
            "messages_sent": client.counters.lines_sent.load(Ordering::Relaxed),
            "messages_received": client.counters.lines_received.load(Ordering::Relaxed),
            "client_provided_id": session.client_provided_id,
            "client_provided_display_name": session.client_provided_display_name,
        }));
    }
    Json(clients)
}

#[derive(Deserialize)]
struct DisconnectForm {
    client_id: u64,
}

async fn post_disconnect(
    State(engine): State<Engine>,
    Form(form): Form<DisconnectForm>,
) -> impl IntoResponse {
    let client = engine
        .state
        .clients
        .get(&form.client_id)
        .map(|entry| entry.value().clone());
    match client {
        Some(client) => {
            engine.close_client(&client, "operator disconnect").await;
            (
                StatusCode::OK,
                format!("client {} disconnected\n", form.client_id),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            format!("no client with id {}\n", form.client_id),
        ),
    }
}

fn payload_map(map: &dashmap::DashMap<String, crate::core::state::StoredPayload>) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for entry in map.iter() {
        let received = entry
            .value()
            .received
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        out.insert(
            entry.key().clone(),
            json!({
                "payload": entry.value().payload,
                "received": received,
            }),
        );
    }
    serde_json::Value::Object(out)
}

async fn get_routerinfo(State(engine): State<Engine>) -> impl IntoResponse {
    Json(payload_map(&engine.state.frdp.routerinfo))
}

async fn get_sharedinfo(State(engine): State<Engine>) -> impl IntoResponse {
    Json(payload_map(&engine.state.frdp.sharedinfo))
}

async fn get_upstream(State(engine): State<Engine>) -> impl IntoResponse {
    let target = engine.state.upstream.target.lock().await.clone();
    Json(json!({
        "name": target.name,
        "host": target.host,
        "port": target.port,
        "connected": engine.state.upstream.is_connected(),
    }))
}

#[derive(Deserialize)]
struct UpstreamForm {
    host: String,
    port: u16,
    #[serde(default)]
    password: String,
}

/// Switchover: atomically replace the target and kick the reconnect loop.
async fn post_upstream(
    State(engine): State<Engine>,
    Form(form): Form<UpstreamForm>,
) -> impl IntoResponse {
    let target = UpstreamTarget {
        name: format!("{}:{}", form.host, form.port),
        host: form.host,
        port: form.port,
        password: (!form.password.is_empty()).then_some(form.password),
    };
    info!("Upstream switchover to {}:{}", target.host, target.port);
    engine.state.upstream.switch_target(target).await;
    (StatusCode::OK, "upstream switchover initiated\n")
}

async fn get_filter_toggle(
    State(engine): State<Engine>,
    Path((filter, action)): Path<(String, String)>,
) -> impl IntoResponse {
    let enable = match action.as_str() {
        "enable" => true,
        "disable" => false,
        _ => return (StatusCode::BAD_REQUEST, "unknown action\n".to_string()),
    };
    let flag = match filter.as_str() {
        "elevation" => &engine.state.filters.elevation,
        "traffic" => &engine.state.filters.traffic,
        _ => return (StatusCode::BAD_REQUEST, "unknown filter\n".to_string()),
    };
    flag.store(enable, Ordering::Relaxed);
    info!("Filter {filter} set to {enable} via API");
    (StatusCode::OK, format!("filter {filter} {action}d\n"))
}

async fn get_blocklist(State(engine): State<Engine>) -> impl IntoResponse {
    let blocklist = engine.state.blocklist.read().await;
    Json(
        blocklist
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>(),
    )
}

#[derive(Deserialize)]
struct BlocklistForm {
    ip: String,
}

async fn post_blocklist_add(
    State(engine): State<Engine>,
    Form(form): Form<BlocklistForm>,
) -> impl IntoResponse {
    let Ok(ip) = form.ip.parse::<IpAddr>() else {
        return (StatusCode::BAD_REQUEST, "invalid address\n".to_string());
    };
    engine.state.blocklist.write().await.insert(ip);
    info!("Added {ip} to the blocklist");

    // Existing sessions from that address are dropped as well.
    let doomed: Vec<_> = engine
        .state
        .clients
        .iter()
        .filter(|entry| entry.value().addr.ip() == ip)
        .map(|entry| entry.value().clone())
        .collect();
    for client in doomed {
        engine.close_client(&client, "blocklisted").await;
    }
    (StatusCode::OK, format!("{ip} blocked\n"))
}

async fn post_blocklist_remove(
    State(engine): State<Engine>,
    Form(form): Form<BlocklistForm>,
) -> impl IntoResponse {
    let Ok(ip) = form.ip.parse::<IpAddr>() else {
        return (StatusCode::BAD_REQUEST, "invalid address\n".to_string());
    };
    engine.state.blocklist.write().await.remove(&ip);
    info!("Removed {ip} from the blocklist");
    (StatusCode::OK, format!("{ip} unblocked\n"))
}

#[derive(Deserialize)]
struct VpilotPrintForm {
    message: String,
}

/// Injects a text message as an ACARS printer line to downstream clients.
async fn post_vpilotprint(
    State(engine): State<Engine>,
    Form(form): Form<VpilotPrintForm>,
) -> impl IntoResponse {
    let line = format!("Qs119={}", form.message);
    engine
        .broadcast_to_clients(&line, &BroadcastOpts::default())
        .await;
    (StatusCode::OK, "message queued\n")
}
