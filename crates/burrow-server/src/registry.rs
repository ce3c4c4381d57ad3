//! Registry of live tunnels

use burrow_proto::Values;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use tracing::trace;

/// Snapshot of one established tunnel
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// Session identifier
    pub id: String,
    /// Name the client announced
    pub name: String,
    /// Physical connection peer
    pub peer_addr: SocketAddr,
    /// Address the shadow listener is bound to
    pub shadow_addr: String,
    /// Values returned to the client by handshake callbacks
    pub values: Values,
    pub connected_at: DateTime<Utc>,
}

/// Live tunnels keyed by session id
///
/// Entries are added once a session is up and removed when it ends.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelInfo>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: TunnelInfo) {
        trace!("Registering tunnel {} ({})", info.id, info.name);
        self.tunnels.insert(info.id.clone(), info);
    }

    pub fn unregister(&self, id: &str) -> Option<TunnelInfo> {
        trace!("Unregistering tunnel {}", id);
        self.tunnels.remove(id).map(|(_, info)| info)
    }

    /// All live tunnels, oldest first
    pub fn all(&self) -> Vec<TunnelInfo> {
        let mut tunnels: Vec<TunnelInfo> = self
            .tunnels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tunnels.sort_by_key(|info| info.connected_at);
        tunnels
    }
}
