//! Inbound transfer pipeline and protocol handler registration.

use std::sync::{Arc, Mutex};

use drift_net::{HandlerFuture, Inbound, NetError, StreamHandler, Substrate};
use drift_protocol::{frame, PeerId, FILE_PROTOCOL};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::TransferError;
use crate::inbox::{Inbox, ReceivedFile};
use crate::registry::{Direction, SessionId, TransferRegistry, TransferStatus};
use crate::spool::{Spool, SpoolTarget};

/// Largest declared payload the receiver will accept.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveLimits {
    pub max_file_size: u64,
}

impl Default for ReceiveLimits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Accepts inbound transfer streams and spools their payloads.
pub struct FileReceiver {
    registry: Arc<TransferRegistry>,
    spool: Spool,
    inbox: Arc<Inbox>,
    limits: ReceiveLimits,
    registration: Mutex<()>,
}

impl FileReceiver {
    pub fn new(
        registry: Arc<TransferRegistry>,
        spool: Spool,
        inbox: Arc<Inbox>,
        limits: ReceiveLimits,
    ) -> Self {
        Self {
            registry,
            spool,
            inbox,
            limits,
            registration: Mutex::new(()),
        }
    }

    /// Install this receiver as the handler for [`FILE_PROTOCOL`] on `net`.
    ///
    /// Any existing handler is removed first, so calling this again (for
    /// example after the node restarts) leaves exactly one handler.
    pub fn register<N: Substrate>(self: &Arc<Self>, net: &N) -> Result<(), NetError> {
        let _guard = self.registration.lock().expect("registration lock poisoned");

        let receiver = Arc::clone(self);
        let handler: StreamHandler<N::Stream> =
            Arc::new(move |inbound: Inbound<N::Stream>| -> HandlerFuture {
                let receiver = Arc::clone(&receiver);
                Box::pin(async move {
                    tracing::debug!(
                        peer = %inbound.remote.fmt_short(),
                        connection = %inbound.connection.id,
                        "inbound transfer stream"
                    );
                    // Failures are already recorded against the session.
                    let _ = receiver.receive(inbound.remote, inbound.stream).await;
                })
            });

        if net.unhandle(FILE_PROTOCOL) {
            tracing::debug!(protocol = FILE_PROTOCOL, "replaced existing handler");
        }
        net.handle(FILE_PROTOCOL, handler)?;
        tracing::info!(protocol = FILE_PROTOCOL, "file receiver registered");
        Ok(())
    }

    /// Remove the [`FILE_PROTOCOL`] handler from `net`.
    pub fn unregister<N: Substrate>(&self, net: &N) -> bool {
        let _guard = self.registration.lock().expect("registration lock poisoned");
        net.unhandle(FILE_PROTOCOL)
    }

    /// Receive one file from `stream`.
    ///
    /// Creates the session, reads the header, spools the payload and adds
    /// the result to the inbox. The stream is shut down whether or not the
    /// transfer succeeds; on failure any partial payload is discarded and
    /// the session is marked as errored.
    pub async fn receive<S>(&self, from: PeerId, mut stream: S) -> Result<SessionId, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let id = self
            .registry
            .create_with_peer(Direction::Receive, "", 0, Some(from));
        let result = self.run(id, from, &mut stream).await;

        if let Err(e) = stream.shutdown().await {
            tracing::debug!(session = %id, error = %e, "stream shutdown failed");
        }
        drop(stream);

        match result {
            Ok(file) => {
                self.inbox.push(file);
                self.registry.set_status(id, TransferStatus::Completed, None);
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(session = %id, peer = %from.fmt_short(), error = %e, "file receive failed");
                self.registry.fail(id, e.to_string());
                Err(e)
            }
        }
    }

    async fn run<S>(
        &self,
        id: SessionId,
        from: PeerId,
        stream: &mut S,
    ) -> Result<ReceivedFile, TransferError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let header = frame::read_header(stream).await?;
        self.registry.describe(id, &header.filename, header.size);
        tracing::info!(
            session = %id,
            file_name = %header.filename,
            size = header.size,
            "receiving file"
        );

        if header.size > self.limits.max_file_size {
            return Err(TransferError::PayloadTooLarge {
                size: header.size,
                limit: self.limits.max_file_size,
            });
        }

        self.registry
            .set_status(id, TransferStatus::Transferring, None);
        let mut target = self
            .spool
            .acquire(id, header.size)
            .await
            .map_err(TransferError::StorageAcquisitionFailed)?;

        if let Err(e) = self.pump(id, stream, &mut target, header.size).await {
            target.discard().await;
            return Err(e);
        }
        tracing::debug!(
            session = %id,
            written = target.written(),
            persistent = target.is_persistent(),
            "payload spooled"
        );

        let blob = target
            .finalize()
            .await
            .map_err(TransferError::StorageWriteFailure)?;
        Ok(ReceivedFile {
            session: id,
            filename: header.filename,
            from,
            blob,
        })
    }

    async fn pump<S>(
        &self,
        id: SessionId,
        stream: &mut S,
        target: &mut SpoolTarget,
        size: u64,
    ) -> Result<(), TransferError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut reader = frame::PayloadReader::new(size);
        while let Some(chunk) = reader.next_chunk(stream).await? {
            target
                .write(chunk)
                .await
                .map_err(TransferError::StorageWriteFailure)?;
            self.registry.advance(id, reader.received());
        }
        Ok(())
    }
}
