//! Connection descriptors and outbound connection selection.

use std::fmt;

use drift_protocol::PeerId;

/// Substrate-assigned identifier for an open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a connection reaches the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Direct path between the two peers.
    Direct,
    /// Traffic forwarded through a relay.
    Relayed,
}

/// A connection to a remote peer as reported by the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: PeerId,
    pub kind: ConnectionKind,
}

impl ConnectionInfo {
    pub fn is_direct(&self) -> bool {
        self.kind == ConnectionKind::Direct
    }
}

/// Pick the connection to open a transfer stream on.
///
/// Prefers the first direct connection in substrate order, otherwise the
/// first connection of any kind.
pub fn select_connection(connections: &[ConnectionInfo]) -> Option<&ConnectionInfo> {
    connections
        .iter()
        .find(|c| c.is_direct())
        .or_else(|| connections.first())
}
