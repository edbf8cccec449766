//! Owns the registry, spool and inbox for one node and wires the sender and
//! receiver to them.

use std::path::Path;
use std::sync::Arc;

use drift_net::{NetError, Substrate};
use drift_protocol::PeerId;
use tokio::io::AsyncRead;

use crate::error::TransferError;
use crate::inbox::{Inbox, ReceivedFile};
use crate::receiver::{FileReceiver, ReceiveLimits};
use crate::registry::{SessionId, TransferRegistry, TransferSession};
use crate::sender::{FileSender, Timeouts};
use crate::spool::{Spool, SpoolConfig, SpoolError};

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub spool: SpoolConfig,
    pub limits: ReceiveLimits,
    pub timeouts: Timeouts,
}

/// File transfer for a single node.
pub struct FileService<N> {
    net: Arc<N>,
    registry: Arc<TransferRegistry>,
    spool: Spool,
    inbox: Arc<Inbox>,
    sender: FileSender<N>,
    receiver: Arc<FileReceiver>,
}

impl<N: Substrate> FileService<N> {
    /// Open the spool (clearing leftovers) and register the inbound handler.
    pub async fn start(net: Arc<N>, config: ServiceConfig) -> Result<Self, TransferError> {
        let registry = Arc::new(TransferRegistry::new());
        let inbox = Arc::new(Inbox::new());
        let spool = Spool::open(config.spool).await;

        let receiver = Arc::new(FileReceiver::new(
            Arc::clone(&registry),
            spool.clone(),
            Arc::clone(&inbox),
            config.limits,
        ));
        receiver.register(net.as_ref())?;

        let sender =
            FileSender::new(Arc::clone(&net), Arc::clone(&registry)).with_timeouts(config.timeouts);

        tracing::info!(
            local = %net.local_id().fmt_short(),
            persistent = spool.dir().is_some(),
            "file service started"
        );

        Ok(Self {
            net,
            registry,
            spool,
            inbox,
            sender,
            receiver,
        })
    }

    /// Re-install the inbound handler, replacing any previous one.
    pub fn reinitialize(&self) -> Result<(), NetError> {
        self.receiver.register(self.net.as_ref())
    }

    /// Stop accepting inbound transfers.
    pub fn shutdown(&self) {
        if self.receiver.unregister(self.net.as_ref()) {
            tracing::info!("file service stopped");
        }
    }

    pub fn net(&self) -> &Arc<N> {
        &self.net
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    pub async fn send<R>(
        &self,
        peer: PeerId,
        filename: &str,
        size: u64,
        source: R,
    ) -> Result<SessionId, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.sender.send(peer, filename, size, source).await
    }

    pub async fn send_bytes(
        &self,
        peer: PeerId,
        filename: &str,
        data: &[u8],
    ) -> Result<SessionId, TransferError> {
        self.sender.send_bytes(peer, filename, data).await
    }

    pub async fn send_file(&self, peer: PeerId, path: &Path) -> Result<SessionId, TransferError> {
        self.sender.send_file(peer, path).await
    }

    pub fn sessions(&self) -> Vec<TransferSession> {
        self.registry.snapshot()
    }

    pub fn received(&self) -> Vec<ReceivedFile> {
        self.inbox.list()
    }

    pub fn clear_finished(&self) -> usize {
        self.registry.clear_finished()
    }

    /// Delete all spooled data and forget received files.
    pub async fn purge_storage(&self) -> Result<usize, SpoolError> {
        let removed = self.spool.purge_all().await?;
        let forgotten = self.inbox.clear();
        tracing::info!(removed, forgotten, "storage purged");
        Ok(removed)
    }
}
