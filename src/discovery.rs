//! LAN server discovery: broadcasts `UNCONNECTED_PING_OPEN_CONNECTIONS` on
//! an interval and tracks who answers. Owned by the [`crate::client::Client`]
//! instance rather than a process-wide static — spec.md §9 "global
//! discovery registry" redesign flag calls out the singleton upstream
//! implementations use as something this client should not repeat.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// How often an active discovery bus re-broadcasts its ping.
pub const DISCOVERY_PING_INTERVAL: Duration = Duration::from_millis(1000);

/// A discovered server is forgotten if it hasn't answered a ping in this long.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub address: SocketAddr,
    pub guid: u64,
    pub identifier: Bytes,
}

struct Entry {
    server: DiscoveredServer,
    last_seen: Instant,
}

/// Tracks servers discovered via unconnected pongs. Call [`tick`] on a
/// fixed interval (driven by the client's own event loop) to both decide
/// when the next ping should fire and to expire stale entries.
///
/// [`tick`]: DiscoveryBus::tick
#[derive(Default)]
pub struct DiscoveryBus {
    servers: HashMap<SocketAddr, Entry>,
    last_ping: Option<Instant>,
}

pub enum Tick {
    /// Nothing to do yet.
    Idle,
    /// A ping broadcast is due now.
    SendPing,
}

/// Which servers a discovery ping should draw a reply from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    /// Discovery is off; no pings are sent.
    #[default]
    None,
    /// Broadcast `UNCONNECTED_PING`, answered by any server regardless of
    /// whether it still accepts new connections.
    AllConnections,
    /// Broadcast `UNCONNECTED_PING_OPEN_CONNECTIONS`, answered only by
    /// servers still open to new connections.
    OpenConnectionsOnly,
}

/// Outcome of recording one pong, distinguishing a brand new server from a
/// known one whose identifier changed from one whose answer was unchanged —
/// only the first two should be surfaced to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    Discovered,
    IdentifierChanged,
    Unchanged,
}

impl DiscoveryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the bus's clock, expiring stale servers and reporting
    /// whether a fresh broadcast is due. Expired entries are returned so
    /// the caller can notify its listener.
    pub fn tick(&mut self, now: Instant) -> (Tick, Vec<DiscoveredServer>) {
        let expired: Vec<SocketAddr> = self
            .servers
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) >= SERVER_TIMEOUT)
            .map(|(addr, _)| *addr)
            .collect();
        let mut forgotten = Vec::with_capacity(expired.len());
        for addr in expired {
            if let Some(entry) = self.servers.remove(&addr) {
                forgotten.push(entry.server);
            }
        }

        let due = match self.last_ping {
            None => true,
            Some(last) => now.duration_since(last) >= DISCOVERY_PING_INTERVAL,
        };
        if due {
            self.last_ping = Some(now);
            (Tick::SendPing, forgotten)
        } else {
            (Tick::Idle, forgotten)
        }
    }

    /// Records a pong, returning whether this server is brand new, known
    /// but answering with a different identifier, or known and unchanged.
    pub fn observe_pong(
        &mut self,
        address: SocketAddr,
        guid: u64,
        identifier: Bytes,
        now: Instant,
    ) -> PongOutcome {
        let server = DiscoveredServer { address, guid, identifier };
        match self.servers.get_mut(&address) {
            Some(entry) => {
                let changed = entry.server.identifier != server.identifier;
                entry.server = server;
                entry.last_seen = now;
                if changed {
                    PongOutcome::IdentifierChanged
                } else {
                    PongOutcome::Unchanged
                }
            }
            None => {
                self.servers.insert(address, Entry { server, last_seen: now });
                PongOutcome::Discovered
            }
        }
    }

    pub fn servers(&self) -> impl Iterator<Item = &DiscoveredServer> {
        self.servers.values().map(|e| &e.server)
    }
}
