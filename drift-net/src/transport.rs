//! Abstract connection substrate for peer-to-peer streams.
//!
//! Defines the [`Substrate`] trait the transfer pipelines are written
//! against. The substrate owns addressing, encryption, relaying and stream
//! multiplexing; drift only dials, opens protocol streams, and registers
//! inbound handlers. [`SimNode`](crate::sim::SimNode) implements it
//! in-process for tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use drift_protocol::PeerId;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::{ConnectionId, ConnectionInfo};

/// Errors reported by a substrate.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("no route to peer {peer}")]
    NoRoute { peer: PeerId },
    #[error("connection {0} is not open")]
    UnknownConnection(ConnectionId),
    #[error("peer does not support protocol {protocol}")]
    ProtocolNotSupported { protocol: String },
    #[error("a handler is already registered for protocol {protocol}")]
    AlreadyRegistered { protocol: String },
}

/// An inbound protocol stream handed to a registered handler.
pub struct Inbound<S> {
    pub remote: PeerId,
    pub connection: ConnectionInfo,
    pub stream: S,
}

/// Future returned by a [`StreamHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback invoked once per inbound stream for a registered protocol.
///
/// The returned future is driven on its own task; it owns the stream and
/// must not report errors back to the substrate.
pub type StreamHandler<S> = Arc<dyn Fn(Inbound<S>) -> HandlerFuture + Send + Sync>;

/// Metrics tracked by a substrate implementation.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub connections_established: AtomicU64,
    pub streams_opened: AtomicU64,
    pub streams_accepted: AtomicU64,
}

impl TransportMetrics {
    /// Create new zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly established connection.
    pub fn record_connection(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound stream.
    pub fn record_stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an inbound stream handed to a handler.
    pub fn record_stream_accepted(&self) {
        self.streams_accepted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Peer-connection substrate providing addressed, multiplexed, ordered streams.
pub trait Substrate: Send + Sync + 'static {
    /// A reliable, ordered, bidirectional byte stream.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// This node's identity.
    fn local_id(&self) -> PeerId;

    /// Open connections to `peer`, in substrate order.
    fn connections(&self, peer: &PeerId) -> Vec<ConnectionInfo>;

    /// Establish a new connection to `peer`.
    fn connect(
        &self,
        peer: &PeerId,
    ) -> impl Future<Output = Result<ConnectionInfo, NetError>> + Send;

    /// Open a new stream for `protocol` on an existing connection.
    fn open_stream(
        &self,
        connection: &ConnectionInfo,
        protocol: &str,
    ) -> impl Future<Output = Result<Self::Stream, NetError>> + Send;

    /// Install the handler for inbound streams of `protocol`.
    ///
    /// Fails with [`NetError::AlreadyRegistered`] if one is installed.
    fn handle(&self, protocol: &str, handler: StreamHandler<Self::Stream>) -> Result<(), NetError>;

    /// Remove the handler for `protocol`, returning whether one was installed.
    fn unhandle(&self, protocol: &str) -> bool;

    /// Get transport metrics.
    fn transport_metrics(&self) -> &TransportMetrics;
}
