// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource
//! management.

use crate::core::state::RouterState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Ensures a client is removed from the client table whenever its handler
/// scope is exited, no matter how.
pub struct ConnectionGuard {
    state: Arc<RouterState>,
    session_id: u64,
    addr: SocketAddr,
}

impl ConnectionGuard {
    pub fn new(state: Arc<RouterState>, session_id: u64, addr: SocketAddr) -> Self {
        Self {
            state,
            session_id,
            addr,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some((_, client)) = self.state.clients.remove(&self.session_id) {
            // Stop the writer task; anything left in the outbound queue is
            // discarded with it.
            client.request_close();
        }
        info!(
            "Closed client connection {} ({})",
            self.session_id, self.addr
        );
    }
}
