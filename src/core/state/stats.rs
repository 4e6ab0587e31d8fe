// src/core/state/stats.rs

//! Router-wide statistics counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Holds all router-wide counters. Everything is atomic so the status
/// display and the REST API read without locking the routing path.
#[derive(Debug, Default)]
pub struct StatsState {
    /// Connections accepted since startup.
    pub total_connections: AtomicU64,
    pub lines_from_upstream: AtomicU64,
    pub lines_from_clients: AtomicU64,
    /// Lines dropped by the elevation filter.
    pub filtered_elevation: AtomicU64,
    /// Lines dropped by the traffic/TCAS filter.
    pub filtered_traffic: AtomicU64,
    /// Lines dropped by the flight-control lock.
    pub filtered_flight_controls: AtomicU64,
    /// Writes from observer clients that were silently dropped.
    pub observer_writes_dropped: AtomicU64,
    /// Variable updates whose keyword is not in the catalogue.
    pub unknown_keywords: AtomicU64,
    /// Malformed or over-long lines dropped.
    pub invalid_lines: AtomicU64,
    /// FRDP messages from peers speaking a different protocol version.
    pub frdp_version_mismatches: AtomicU64,
}

/// A point-in-time copy for serialization.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub lines_from_upstream: u64,
    pub lines_from_clients: u64,
    pub filtered_elevation: u64,
    pub filtered_traffic: u64,
    pub filtered_flight_controls: u64,
    pub observer_writes_dropped: u64,
    pub unknown_keywords: u64,
    pub invalid_lines: u64,
    pub frdp_version_mismatches: u64,
}

impl StatsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            lines_from_upstream: self.lines_from_upstream.load(Ordering::Relaxed),
            lines_from_clients: self.lines_from_clients.load(Ordering::Relaxed),
            filtered_elevation: self.filtered_elevation.load(Ordering::Relaxed),
            filtered_traffic: self.filtered_traffic.load(Ordering::Relaxed),
            filtered_flight_controls: self.filtered_flight_controls.load(Ordering::Relaxed),
            observer_writes_dropped: self.observer_writes_dropped.load(Ordering::Relaxed),
            unknown_keywords: self.unknown_keywords.load(Ordering::Relaxed),
            invalid_lines: self.invalid_lines.load(Ordering::Relaxed),
            frdp_version_mismatches: self.frdp_version_mismatches.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
