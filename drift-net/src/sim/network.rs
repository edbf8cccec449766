//! Simulation network controller.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use drift_protocol::PeerId;

use crate::connection::{ConnectionId, ConnectionInfo, ConnectionKind};
use crate::transport::NetError;

use super::node::{NodeState, SimNode};

/// Default in-flight buffer for each simulated stream.
const DEFAULT_STREAM_BUFFER: usize = 64 * 1024;

/// A connection between two simulated nodes.
#[derive(Debug, Clone)]
struct SimLink {
    id: ConnectionId,
    a: PeerId,
    b: PeerId,
    kind: ConnectionKind,
}

impl SimLink {
    fn joins(&self, x: &PeerId, y: &PeerId) -> bool {
        (self.a == *x && self.b == *y) || (self.a == *y && self.b == *x)
    }

    /// The link as seen from `local`.
    fn view_from(&self, local: &PeerId) -> ConnectionInfo {
        let remote = if self.a == *local { self.b } else { self.a };
        ConnectionInfo {
            id: self.id,
            remote,
            kind: self.kind,
        }
    }
}

/// Shared interior of the simulation network.
pub(crate) struct SimNetworkInner {
    nodes: RwLock<HashMap<PeerId, Arc<NodeState>>>,
    /// Open links in creation order.
    links: RwLock<Vec<SimLink>>,
    disconnected: RwLock<HashSet<PeerId>>,
    connect_latency: RwLock<Duration>,
    stream_open_delay: RwLock<Duration>,
    stream_buffer: usize,
    next_connection: AtomicU64,
}

impl SimNetworkInner {
    pub(crate) fn node(&self, id: &PeerId) -> Option<Arc<NodeState>> {
        self.nodes
            .read()
            .expect("sim nodes lock poisoned")
            .get(id)
            .cloned()
    }

    pub(crate) fn connections_between(&self, local: &PeerId, remote: &PeerId) -> Vec<ConnectionInfo> {
        self.links
            .read()
            .expect("sim links lock poisoned")
            .iter()
            .filter(|l| l.joins(local, remote))
            .map(|l| l.view_from(local))
            .collect()
    }

    /// Look up a link by id from `local`'s point of view.
    pub(crate) fn connection(&self, local: &PeerId, id: ConnectionId) -> Option<ConnectionInfo> {
        self.links
            .read()
            .expect("sim links lock poisoned")
            .iter()
            .find(|l| l.id == id && (l.a == *local || l.b == *local))
            .map(|l| l.view_from(local))
    }

    pub(crate) fn add_link(&self, a: PeerId, b: PeerId, kind: ConnectionKind) -> ConnectionId {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        self.links
            .write()
            .expect("sim links lock poisoned")
            .push(SimLink { id, a, b, kind });
        tracing::debug!(connection = %id, a = %a, b = %b, ?kind, "sim link added");
        id
    }

    /// Fail with [`NetError::NoRoute`] unless both nodes exist and are online.
    pub(crate) fn check_route(&self, from: &PeerId, to: &PeerId) -> Result<(), NetError> {
        if self.node(to).is_none() {
            return Err(NetError::NoRoute { peer: *to });
        }
        let disconnected = self.disconnected.read().expect("sim lock poisoned");
        if disconnected.contains(from) || disconnected.contains(to) {
            return Err(NetError::NoRoute { peer: *to });
        }
        Ok(())
    }

    pub(crate) fn connect_latency(&self) -> Duration {
        *self.connect_latency.read().expect("sim lock poisoned")
    }

    pub(crate) fn stream_open_delay(&self) -> Duration {
        *self.stream_open_delay.read().expect("sim lock poisoned")
    }

    pub(crate) fn stream_buffer(&self) -> usize {
        self.stream_buffer
    }
}

/// Simulation network controller.
///
/// Creates simulated nodes, manages links between them, and controls
/// network conditions (latency, stream-open delay, disconnection).
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<SimNetworkInner>,
}

impl SimNetwork {
    /// Create a new simulation network.
    pub fn new() -> Self {
        Self::with_stream_buffer(DEFAULT_STREAM_BUFFER)
    }

    /// Create a network whose streams buffer at most `bytes` in flight.
    pub fn with_stream_buffer(bytes: usize) -> Self {
        tracing::info!(stream_buffer = bytes, "created sim network");
        Self {
            inner: Arc::new(SimNetworkInner {
                nodes: RwLock::new(HashMap::new()),
                links: RwLock::new(Vec::new()),
                disconnected: RwLock::new(HashSet::new()),
                connect_latency: RwLock::new(Duration::ZERO),
                stream_open_delay: RwLock::new(Duration::ZERO),
                stream_buffer: bytes,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Create a node with a fresh random identity.
    pub fn create_node(&self, name: &str) -> SimNode {
        let id = PeerId::random();
        let state = Arc::new(NodeState::new(name.to_string()));
        self.inner
            .nodes
            .write()
            .expect("sim nodes lock poisoned")
            .insert(id, Arc::clone(&state));
        tracing::info!(peer = %id, name, "created sim node");
        SimNode::new(id, state, Arc::clone(&self.inner))
    }

    /// Add a link between two nodes, returning its connection id.
    pub fn link(&self, a: &SimNode, b: &SimNode, kind: ConnectionKind) -> ConnectionId {
        self.inner.add_link(a.id(), b.id(), kind)
    }

    /// Close every link between two nodes.
    pub fn unlink(&self, a: &SimNode, b: &SimNode) {
        let (a, b) = (a.id(), b.id());
        self.inner
            .links
            .write()
            .expect("sim links lock poisoned")
            .retain(|l| !l.joins(&a, &b));
        tracing::debug!(a = %a, b = %b, "sim links closed");
    }

    /// Delay applied to every `connect` call.
    pub fn set_connect_latency(&self, duration: Duration) {
        *self.inner.connect_latency.write().expect("sim lock poisoned") = duration;
        tracing::debug!(?duration, "set connect latency");
    }

    /// Delay applied to every `open_stream` call.
    pub fn set_stream_open_delay(&self, duration: Duration) {
        *self.inner.stream_open_delay.write().expect("sim lock poisoned") = duration;
        tracing::debug!(?duration, "set stream open delay");
    }

    /// Simulate a node going offline (connects and stream opens fail).
    pub fn disconnect(&self, node: &SimNode) {
        self.inner
            .disconnected
            .write()
            .expect("sim lock poisoned")
            .insert(node.id());
        tracing::info!(peer = %node.id(), "sim node disconnected");
    }

    /// Simulate a node coming back online.
    pub fn reconnect(&self, node: &SimNode) {
        self.inner
            .disconnected
            .write()
            .expect("sim lock poisoned")
            .remove(&node.id());
        tracing::info!(peer = %node.id(), "sim node reconnected");
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}
