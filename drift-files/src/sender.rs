//! Outbound transfer pipeline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use drift_net::{select_connection, ConnectionInfo, Substrate};
use drift_protocol::{frame, FileHeader, PeerId, FILE_PROTOCOL};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::TransferError;
use crate::registry::{Direction, SessionId, TransferRegistry, TransferStatus};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadlines for reaching a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Dialing when no connection to the peer is open.
    pub connect: Duration,
    /// Opening the transfer stream on a chosen connection.
    pub stream_open: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: CONNECT_TIMEOUT,
            stream_open: STREAM_OPEN_TIMEOUT,
        }
    }
}

/// Sends files to peers, one stream per file.
pub struct FileSender<N> {
    net: Arc<N>,
    registry: Arc<TransferRegistry>,
    timeouts: Timeouts,
}

impl<N: Substrate> FileSender<N> {
    pub fn new(net: Arc<N>, registry: Arc<TransferRegistry>) -> Self {
        Self {
            net,
            registry,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Stream `size` bytes from `source` to `peer` as `filename`.
    ///
    /// The session is registered before any network activity, so it shows
    /// up as pending while the peer is being reached. On failure the
    /// session is marked as errored and the error returned.
    pub async fn send<R>(
        &self,
        peer: PeerId,
        filename: &str,
        size: u64,
        mut source: R,
    ) -> Result<SessionId, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = self
            .registry
            .create_with_peer(Direction::Send, filename, size, Some(peer));
        tracing::info!(
            session = %id,
            peer = %peer.fmt_short(),
            file_name = %filename,
            size,
            "sending file"
        );

        match self.run(id, peer, filename, size, &mut source).await {
            Ok(()) => {
                self.registry.set_status(id, TransferStatus::Completed, None);
                tracing::info!(session = %id, file_name = %filename, "file send complete");
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(session = %id, file_name = %filename, error = %e, "file send failed");
                self.registry.fail(id, e.to_string());
                Err(e)
            }
        }
    }

    /// Send an in-memory buffer.
    pub async fn send_bytes(
        &self,
        peer: PeerId,
        filename: &str,
        data: &[u8],
    ) -> Result<SessionId, TransferError> {
        self.send(peer, filename, data.len() as u64, data).await
    }

    /// Send a file from disk under its own file name.
    pub async fn send_file(&self, peer: PeerId, path: &Path) -> Result<SessionId, TransferError> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("path has no file name: {}", path.display()),
                ))
            })?;
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        self.send(peer, &filename, size, file).await
    }

    async fn run<R>(
        &self,
        id: SessionId,
        peer: PeerId,
        filename: &str,
        size: u64,
        source: &mut R,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut stream = self.open_transfer_stream(peer).await?;
        self.registry
            .set_status(id, TransferStatus::Transferring, None);

        frame::write_header(&mut stream, &FileHeader::new(filename, size)).await?;
        frame::write_payload(source, &mut stream, size, |sent| {
            self.registry.advance(id, sent)
        })
        .await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn open_transfer_stream(&self, peer: PeerId) -> Result<N::Stream, TransferError> {
        let connection = match select_connection(&self.net.connections(&peer)).cloned() {
            Some(connection) => connection,
            None => self.dial(peer).await?,
        };
        tracing::debug!(
            peer = %peer.fmt_short(),
            connection = %connection.id,
            direct = connection.is_direct(),
            "using connection"
        );

        let timeout = self.timeouts.stream_open;
        match tokio::time::timeout(timeout, self.net.open_stream(&connection, FILE_PROTOCOL)).await
        {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(TransferError::HandshakeTimeout { peer, timeout }),
        }
    }

    async fn dial(&self, peer: PeerId) -> Result<ConnectionInfo, TransferError> {
        tracing::debug!(peer = %peer.fmt_short(), "no open connection, dialing");
        let timeout = self.timeouts.connect;
        match tokio::time::timeout(timeout, self.net.connect(&peer)).await {
            Ok(connection) => Ok(connection?),
            Err(_) => Err(TransferError::DialTimeout { peer, timeout }),
        }
    }
}
