// src/core/state/mod.rs

//! Defines the central `RouterState` struct and all related state
//! components. Broken down into logical parts for better organization.

mod client;
mod core;
mod stats;
mod upstream;

pub use self::core::{
    FilterFlags, FrdpState, RouterInit, RouterState, StoredPayload, TrafficDirection,
    TrafficEntry, TrafficLogHandle,
};
pub use client::{ClientHandle, ClientMap, ConnCounters};
pub use stats::{StatsSnapshot, StatsState};
pub use upstream::{UpstreamPeer, UpstreamShared, UpstreamTarget};
