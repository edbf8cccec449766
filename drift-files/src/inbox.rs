//! Completed inbound files, in arrival order.

use std::sync::RwLock;

use drift_protocol::PeerId;
use tokio::sync::watch;

use crate::registry::SessionId;
use crate::spool::Blob;

#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub session: SessionId,
    pub filename: String,
    pub from: PeerId,
    pub blob: Blob,
}

/// Append-only list of received files that observers can watch.
#[derive(Debug)]
pub struct Inbox {
    files: RwLock<Vec<ReceivedFile>>,
    count: watch::Sender<usize>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            files: RwLock::new(Vec::new()),
            count,
        }
    }

    pub fn push(&self, file: ReceivedFile) {
        tracing::info!(
            session = %file.session,
            file_name = %file.filename,
            from = %file.from.fmt_short(),
            size = file.blob.len(),
            persistent = file.blob.is_persistent(),
            "file received"
        );
        let len = {
            let mut files = self.files.write().expect("inbox poisoned");
            files.push(file);
            files.len()
        };
        self.count.send_replace(len);
    }

    pub fn list(&self) -> Vec<ReceivedFile> {
        self.files.read().expect("inbox poisoned").clone()
    }

    pub fn get(&self, session: SessionId) -> Option<ReceivedFile> {
        self.files
            .read()
            .expect("inbox poisoned")
            .iter()
            .find(|f| f.session == session)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.files.read().expect("inbox poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let removed = std::mem::take(&mut *self.files.write().expect("inbox poisoned")).len();
        self.count.send_replace(0);
        removed
    }

    /// Watch the number of entries.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }
}
