//! Idle watchdog: purges spooled payloads once nothing is using them.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use drift_files::{FileService, SpoolError};
use drift_net::Substrate;
use tokio::task::JoinHandle;

/// Something that knows how many clients are active and can drop its
/// stored payloads.
pub trait ActiveClients: Send + Sync + 'static {
    fn active_clients(&self) -> usize;

    /// Delete stored payloads along with anything still referring to them.
    /// Returns the number of spool files removed.
    fn purge(&self) -> impl Future<Output = Result<usize, SpoolError>> + Send;
}

/// A file service is busy while any of its transfers is unfinished.
impl<N: Substrate> ActiveClients for FileService<N> {
    fn active_clients(&self) -> usize {
        self.sessions()
            .iter()
            .filter(|s| !s.status.is_terminal())
            .count()
    }

    fn purge(&self) -> impl Future<Output = Result<usize, SpoolError>> + Send {
        self.purge_storage()
    }
}

/// Purge `clients` if it reports nobody active.
///
/// Returns the number of spool files removed, or `None` if clients were
/// active.
pub async fn check_once<C: ActiveClients>(clients: &C) -> Result<Option<usize>, SpoolError> {
    let active = clients.active_clients();
    if active > 0 {
        tracing::debug!(active, "clients active, skipping purge");
        return Ok(None);
    }
    let removed = clients.purge().await?;
    tracing::info!(removed, "idle, storage purged");
    Ok(Some(removed))
}

/// Run [`check_once`] every `interval` until `clients` is dropped.
///
/// The first check happens one full interval after spawning.
pub fn spawn<C: ActiveClients>(clients: &Arc<C>, interval: Duration) -> JoinHandle<()> {
    let clients: Weak<C> = Arc::downgrade(clients);
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            ticker.tick().await;
            let Some(clients) = clients.upgrade() else {
                tracing::debug!("clients dropped, watchdog exiting");
                break;
            };
            if let Err(e) = check_once(clients.as_ref()).await {
                tracing::warn!(error = %e, "storage purge failed");
            }
        }
    })
}
