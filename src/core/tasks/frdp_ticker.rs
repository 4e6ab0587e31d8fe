// src/core/tasks/frdp_ticker.rs

//! Periodic FRDP housekeeping: solicited PINGs to peer routers and the
//! ROUTERINFO broadcast.

use crate::core::frdp::{
    self, ConnectionInfo, FilterInfo, FrdpMessage, RouterInfoPayload, FRDP_VERSION,
    PING_INTERVAL_SECS, ROUTERINFO_INTERVAL_SECS,
};
use crate::core::router::Engine;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub struct FrdpTicker {
    engine: Engine,
}

impl FrdpTicker {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        let mut info_interval =
            tokio::time::interval(Duration::from_secs(ROUTERINFO_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("FRDP ticker shutting down.");
                    return;
                }
                _ = ping_interval.tick() => self.send_pings().await,
                _ = info_interval.tick() => self.broadcast_routerinfo().await,
            }
        }
    }

    /// Sends a PING carrying a fresh nonce to the upstream (when it is a
    /// router) and to every peer-router client.
    async fn send_pings(&self) {
        let state = &self.engine.state;

        let upstream_ping = {
            let mut peer = state.upstream.peer.lock().await;
            if state.upstream.is_connected() && peer.is_peer_router {
                let id = frdp::random_request_id();
                peer.ping_request_id = Some(id.clone());
                peer.ping_sent_at = Some(Instant::now());
                Some(id)
            } else {
                None
            }
        };
        if let Some(id) = upstream_ping {
            debug!("Sending FRDP ping to upstream");
            self.engine
                .send_to_upstream(&FrdpMessage::Ping { id }.to_line(FRDP_VERSION))
                .await;
        }

        for entry in state.clients.iter() {
            let client = entry.value();
            let line = {
                let mut session = client.session.lock().await;
                if !session.is_peer_router {
                    continue;
                }
                let id = frdp::random_request_id();
                session.ping_request_id = Some(id.clone());
                session.ping_sent_at = Some(Instant::now());
                FrdpMessage::Ping { id }.to_line(FRDP_VERSION)
            };
            debug!("Sending FRDP ping to client {}", client.id);
            client.enqueue(&line);
        }
    }

    /// Broadcasts our ROUTERINFO so every router in the network learns
    /// about this one. Keyed by UUID on the receiving side.
    async fn broadcast_routerinfo(&self) {
        let state = &self.engine.state;
        let (router_name, simulator_name) = {
            let config = state.config.lock().await;
            (
                config.identity.router.clone(),
                config.identity.simulator.clone(),
            )
        };

        let mut connections = Vec::new();
        for entry in state.clients.iter() {
            let client = entry.value();
            let session = client.session.lock().await;
            if !session.access.has_access() {
                continue;
            }
            connections.push(ConnectionInfo {
                id: client.id,
                display_name: session.display_name.clone(),
                ip: client.addr.ip().to_string(),
                port: client.addr.port(),
                is_router: session.is_peer_router,
            });
        }

        let payload = RouterInfoPayload {
            router_name,
            simulator_name,
            uuid: state.frdp.uuid.to_string(),
            uptime: state.uptime_secs(),
            filters: FilterInfo {
                elevation: state.filters.elevation.load(Ordering::Relaxed),
                traffic: state.filters.traffic.load(Ordering::Relaxed),
                flight_controls: state.filters.flight_controls.load(Ordering::Relaxed),
            },
            connections,
        };
        let Ok(json) = serde_json::to_string(&payload) else {
            return;
        };
        let line = FrdpMessage::RouterInfo { json }.to_line(FRDP_VERSION);

        if state.upstream.is_connected() && state.upstream.peer.lock().await.is_peer_router {
            self.engine.send_to_upstream(&line).await;
        }
        for entry in state.clients.iter() {
            let client = entry.value();
            if client.session.lock().await.is_peer_router {
                client.enqueue(&line);
            }
        }
    }
}
