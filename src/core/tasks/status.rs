// src/core/tasks/status.rs

//! The operator status display: a periodic multi-line table on stdout
//! plus a one-line aircraft summary pulled from the cache, and the
//! configured connectivity checks.

use crate::config::CheckType;
use crate::core::state::RouterState;
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const HEADER_LINE_LENGTH: usize = 110;

pub struct StatusTicker {
    state: Arc<RouterState>,
}

impl StatusTicker {
    pub fn new(state: Arc<RouterState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let (interval_secs, aircraft, monitor_delay_warning) = {
            let config = self.state.config.lock().await;
            (
                config.display.status_interval,
                config.display.aircraft_status,
                config.performance.monitor_delay_warning,
            )
        };
        let mut interval = tokio::time::interval(Duration::from_secs_f64(interval_secs));
        let mut last_tick: Option<std::time::Instant> = None;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = interval.tick() => {
                    // A late tick means something starved the runtime.
                    if let Some(last) = last_tick {
                        let drift = last.elapsed().as_secs_f64() - interval_secs;
                        if drift > monitor_delay_warning {
                            warn!("Status monitor ran {drift:.3} s late");
                        }
                    }
                    last_tick = Some(std::time::Instant::now());
                    self.print_status().await;
                    if aircraft {
                        self.print_aircraft_status().await;
                    }
                    self.run_checks().await;
                }
            }
        }
    }

    async fn print_status(&self) {
        let state = &self.state;
        let (router_name, listen_port) = {
            let config = state.config.lock().await;
            (config.identity.router.clone(), config.listen.port)
        };
        let cached = state.cache.lock().await.len();

        info!("{}", "-".repeat(HEADER_LINE_LENGTH));
        info!(
            "Frankenrouter {} port {}, {} keywords cached, uptime {} s, upstream connects {}",
            router_name,
            listen_port,
            cached,
            state.uptime_secs(),
            state.upstream.reconnects.load(Ordering::Relaxed),
        );

        let mut upstream_line = if state.upstream.is_connected() {
            let target = state.upstream.target.lock().await;
            format!("UPSTREAM {} {}:{}", target.name, target.host, target.port)
        } else {
            "[NO UPSTREAM CONNECTION]".to_string()
        };
        {
            let peer = state.upstream.peer.lock().await;
            if !peer.rtts.is_empty() {
                let mean: f64 = peer.rtts.iter().sum::<f64>() / peer.rtts.len() as f64;
                let max = peer.rtts.iter().cloned().fold(f64::MIN, f64::max);
                upstream_line
                    .push_str(&format!(", RTT mean/max: {:.1}/{:.1} ms", mean * 1000.0, max * 1000.0));
            }
        }
        if let Some((mean, max)) = state.upstream.counters.write_time_mean_max() {
            upstream_line.push_str(&format!(
                ", output delay avg/max {:.1}/{:.1} ms",
                mean * 1000.0,
                max * 1000.0
            ));
        }
        info!("{upstream_line}");

        info!(
            "{:>2} {:<24} {:<15} {:>5} {:>8} {:>6} {:>6} {:>8} {:>8} {:>9} {:>9}",
            "id",
            "Identifier",
            "Client IP",
            "Port",
            "Access",
            "Lin",
            "Lout",
            "Bin",
            "Bout",
            "RTT ms",
            "Queue B",
        );
        for entry in state.clients.iter() {
            let client = entry.value();
            let session = client.session.lock().await;
            let access = match session.access {
                crate::connection::AccessState::Pending => "pending",
                crate::connection::AccessState::Granted(level) => level.as_str(),
            };
            let rtt = session
                .rtt_mean_max()
                .map(|(mean, _)| format!("{:.1}", mean * 1000.0))
                .unwrap_or_else(|| "-".to_string());
            info!(
                "{:>2} {:<24} {:<15} {:>5} {:>8} {:>6} {:>6} {:>8} {:>8} {:>9} {:>9}",
                client.id,
                session.display_name,
                client.addr.ip(),
                client.addr.port(),
                access,
                client.counters.lines_received.load(Ordering::Relaxed),
                client.counters.lines_sent.load(Ordering::Relaxed),
                client.counters.bytes_received.load(Ordering::Relaxed),
                client.counters.bytes_sent.load(Ordering::Relaxed),
                rtt,
                client.counters.queued_bytes.load(Ordering::Relaxed),
            );
        }
        info!("{}", "-".repeat(HEADER_LINE_LENGTH));

        // Queue-depth high-water warnings.
        let high_water = state.config.lock().await.performance.write_buffer_warning;
        for entry in state.clients.iter() {
            let client = entry.value();
            let queued = client.counters.queued_bytes.load(Ordering::Relaxed);
            if queued > high_water {
                warn!(
                    "Write buffer {queued} > {high_water} for client {}",
                    client.id
                );
            }
        }
        let dropped = state.traffic_log.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!("Traffic log dropped {dropped} entries so far");
        }
    }

    /// Decodes the PiBaHeAlTas vector from Qs121 into a human-readable
    /// line, as a sanity check that the data flowing through is sane.
    async fn print_aircraft_status(&self) {
        let value = {
            let cache = self.state.cache.lock().await;
            cache.get("Qs121").map(|v| v.to_string())
        };
        let Some(value) = value else { return };
        let fields: Vec<f64> = value
            .split(';')
            .filter_map(|f| f.parse::<f64>().ok())
            .collect();
        if fields.len() < 7 {
            return;
        }
        info!(
            "pitch={:.1} bank={:.1} heading={:.0} altitude_true={:.0} TAS={:.0} lat={:.6} lon={:.6}",
            (fields[0] / 1_000_000.0).to_degrees(),
            (fields[1] / 1_000_000.0).to_degrees(),
            fields[2].to_degrees(),
            fields[3] / 1000.0,
            fields[4] / 1000.0,
            fields[5].to_degrees(),
            fields[6].to_degrees(),
        );
    }

    /// Evaluates the configured `[[check]]` rules against the client
    /// table.
    async fn run_checks(&self) {
        let checks = {
            let config = self.state.config.lock().await;
            config.check.clone()
        };
        if checks.is_empty() {
            return;
        }

        // Collect the facts once per pass.
        let mut names: Vec<String> = Vec::new();
        let mut router_count = 0usize;
        for entry in self.state.clients.iter() {
            let session = entry.value().session.lock().await;
            if !session.access.has_access() {
                continue;
            }
            if session.is_peer_router {
                router_count += 1;
            }
            names.push(session.display_name.clone());
        }

        for check in checks {
            let count = match check.check_type {
                CheckType::IsFrankenrouter => router_count,
                CheckType::NameRegexp => {
                    let Some(pattern) = check.regexp.as_deref() else {
                        continue;
                    };
                    let Ok(re) = Regex::new(pattern) else { continue };
                    names.iter().filter(|n| re.is_match(n)).count()
                }
            };
            let comment = check.comment.as_deref().unwrap_or("");
            if let Some(min) = check.limit_min
                && count < min
            {
                warn!("CHECK: {count} matching clients, expected at least {min}. {comment}");
            }
            if let Some(max) = check.limit_max
                && count > max
            {
                warn!("CHECK: {count} matching clients, expected at most {max}. {comment}");
            }
        }
    }
}
