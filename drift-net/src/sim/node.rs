//! Simulated node implementing the [`Substrate`] trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use drift_protocol::PeerId;
use tokio::io::DuplexStream;

use crate::connection::{ConnectionInfo, ConnectionKind};
use crate::transport::{Inbound, NetError, StreamHandler, Substrate, TransportMetrics};

use super::network::SimNetworkInner;

/// Per-node state shared with the network so remote nodes can reach it.
pub(crate) struct NodeState {
    name: String,
    handlers: RwLock<HashMap<String, StreamHandler<DuplexStream>>>,
    metrics: TransportMetrics,
}

impl NodeState {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            handlers: RwLock::new(HashMap::new()),
            metrics: TransportMetrics::new(),
        }
    }

    fn handler(&self, protocol: &str) -> Option<StreamHandler<DuplexStream>> {
        self.handlers
            .read()
            .expect("sim handlers lock poisoned")
            .get(protocol)
            .cloned()
    }
}

/// A simulated node on a [`SimNetwork`](super::SimNetwork).
///
/// Streams are `tokio::io::DuplexStream` pairs: the opener keeps one end and
/// the other is handed to the remote node's registered handler on a fresh
/// task.
#[derive(Clone)]
pub struct SimNode {
    id: PeerId,
    state: Arc<NodeState>,
    network: Arc<SimNetworkInner>,
}

impl SimNode {
    pub(crate) fn new(id: PeerId, state: Arc<NodeState>, network: Arc<SimNetworkInner>) -> Self {
        Self { id, state, network }
    }

    /// Get the node's identifier.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Get the node's display name.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether a handler is installed for `protocol`.
    pub fn has_handler(&self, protocol: &str) -> bool {
        self.state.handler(protocol).is_some()
    }

    /// Number of installed protocol handlers.
    pub fn handler_count(&self) -> usize {
        self.state
            .handlers
            .read()
            .expect("sim handlers lock poisoned")
            .len()
    }
}

impl Substrate for SimNode {
    type Stream = DuplexStream;

    fn local_id(&self) -> PeerId {
        self.id
    }

    fn connections(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        self.network.connections_between(&self.id, peer)
    }

    async fn connect(&self, peer: &PeerId) -> Result<ConnectionInfo, NetError> {
        self.network.check_route(&self.id, peer)?;

        let latency = self.network.connect_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.network.check_route(&self.id, peer)?;

        let id = self.network.add_link(self.id, *peer, ConnectionKind::Direct);
        self.state.metrics.record_connection();
        tracing::debug!(local = %self.id, remote = %peer, connection = %id, "sim connection established");

        Ok(ConnectionInfo {
            id,
            remote: *peer,
            kind: ConnectionKind::Direct,
        })
    }

    async fn open_stream(
        &self,
        connection: &ConnectionInfo,
        protocol: &str,
    ) -> Result<DuplexStream, NetError> {
        let delay = self.network.stream_open_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let local_view = self
            .network
            .connection(&self.id, connection.id)
            .ok_or(NetError::UnknownConnection(connection.id))?;
        let remote_id = local_view.remote;
        self.network.check_route(&self.id, &remote_id)?;

        let remote = self
            .network
            .node(&remote_id)
            .ok_or(NetError::NoRoute { peer: remote_id })?;
        let handler = remote
            .handler(protocol)
            .ok_or_else(|| NetError::ProtocolNotSupported {
                protocol: protocol.to_string(),
            })?;
        let remote_view = self
            .network
            .connection(&remote_id, connection.id)
            .ok_or(NetError::UnknownConnection(connection.id))?;

        let (local_end, remote_end) = tokio::io::duplex(self.network.stream_buffer());

        self.state.metrics.record_stream_opened();
        remote.metrics.record_stream_accepted();
        tracing::debug!(
            local = %self.id,
            remote = %remote_id,
            connection = %connection.id,
            protocol,
            "opened sim stream"
        );

        tokio::spawn(handler(Inbound {
            remote: self.id,
            connection: remote_view,
            stream: remote_end,
        }));

        Ok(local_end)
    }

    fn handle(&self, protocol: &str, handler: StreamHandler<DuplexStream>) -> Result<(), NetError> {
        let mut handlers = self
            .state
            .handlers
            .write()
            .expect("sim handlers lock poisoned");
        if handlers.contains_key(protocol) {
            return Err(NetError::AlreadyRegistered {
                protocol: protocol.to_string(),
            });
        }
        handlers.insert(protocol.to_string(), handler);
        tracing::debug!(peer = %self.id, protocol, "handler registered");
        Ok(())
    }

    fn unhandle(&self, protocol: &str) -> bool {
        let removed = self
            .state
            .handlers
            .write()
            .expect("sim handlers lock poisoned")
            .remove(protocol)
            .is_some();
        if removed {
            tracing::debug!(peer = %self.id, protocol, "handler removed");
        }
        removed
    }

    fn transport_metrics(&self) -> &TransportMetrics {
        &self.state.metrics
    }
}

impl std::fmt::Debug for SimNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNode")
            .field("id", &self.id)
            .field("name", &self.state.name)
            .finish()
    }
}
