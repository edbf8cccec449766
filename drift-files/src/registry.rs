//! Process-wide table of transfer sessions.
//!
//! Every send and every accepted inbound stream gets a session. Observers
//! read consistent snapshots while the pipelines update progress; each
//! session carries its own lock so updates to one transfer never block
//! another.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use drift_protocol::PeerId;
use tokio::sync::watch;
use uuid::Uuid;

/// Unique identifier for a transfer session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the textual form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0.simple())
    }
}

/// Which side of the transfer this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Error,
}

impl TransferStatus {
    /// Completed or errored. Terminal sessions never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Forward-only lifecycle: pending -> transferring -> completed | error,
    /// with pending -> error for sessions that fail before any payload moves.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Transferring)
                | (Self::Pending, Self::Error)
                | (Self::Transferring, Self::Completed)
                | (Self::Transferring, Self::Error)
        )
    }
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub id: SessionId,
    pub direction: Direction,
    pub filename: String,
    pub size: u64,
    pub transferred: u64,
    pub status: TransferStatus,
    /// Present exactly when `status` is [`TransferStatus::Error`].
    pub error: Option<String>,
    pub peer: Option<PeerId>,
    described: bool,
    seq: u64,
}

/// Shared table of sessions, safe for concurrent pipelines and observers.
#[derive(Debug)]
pub struct TransferRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<TransferSession>>>>,
    next_seq: AtomicU64,
    changes: watch::Sender<u64>,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            changes,
        }
    }

    /// Create a pending session. Receive sessions are usually created with
    /// an empty filename and zero size, then filled in by [`Self::describe`]
    /// once the header arrives.
    pub fn create(&self, direction: Direction, filename: &str, size: u64) -> SessionId {
        self.create_with_peer(direction, filename, size, None)
    }

    /// Like [`Self::create`], recording the remote peer.
    pub fn create_with_peer(
        &self,
        direction: Direction,
        filename: &str,
        size: u64,
        peer: Option<PeerId>,
    ) -> SessionId {
        let id = SessionId::new();
        let session = TransferSession {
            id,
            direction,
            filename: filename.to_string(),
            size,
            transferred: 0,
            status: TransferStatus::Pending,
            error: None,
            peer,
            described: direction == Direction::Send,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.sessions
            .write()
            .expect("session table poisoned")
            .insert(id, Arc::new(Mutex::new(session)));
        tracing::debug!(session = %id, ?direction, filename, size, "session created");
        self.notify();
        id
    }

    /// Fill in the name and size of a receive session from its decoded header.
    ///
    /// # Panics
    ///
    /// If the session has already been described or has left `Pending`.
    pub fn describe(&self, id: SessionId, filename: &str, size: u64) {
        let Some(entry) = self.entry(id) else {
            tracing::warn!(session = %id, "describe on unknown session ignored");
            return;
        };
        {
            let mut session = entry.lock().expect("session poisoned");
            let valid = !session.described && session.status == TransferStatus::Pending;
            if valid {
                session.filename = filename.to_string();
                session.size = size;
                session.described = true;
            } else {
                let status = session.status;
                drop(session);
                panic!("session {id} cannot be described in state {status:?}");
            }
        }
        tracing::debug!(session = %id, filename, size, "session described");
        self.notify();
    }

    /// Move a session to `status`. `error` is recorded only for
    /// [`TransferStatus::Error`].
    ///
    /// # Panics
    ///
    /// On a transition the lifecycle does not allow.
    pub fn set_status(&self, id: SessionId, status: TransferStatus, error: Option<String>) {
        let Some(entry) = self.entry(id) else {
            tracing::warn!(session = %id, ?status, "status update on unknown session ignored");
            return;
        };
        {
            let mut session = entry.lock().expect("session poisoned");
            let from = session.status;
            if !from.can_transition_to(status) {
                drop(session);
                panic!("illegal transition {from:?} -> {status:?} for session {id}");
            }
            debug_assert!(
                status != TransferStatus::Completed || session.transferred == session.size,
                "session {id} completed with {} of {} bytes",
                session.transferred,
                session.size
            );
            session.status = status;
            session.error = match status {
                TransferStatus::Error => {
                    Some(error.unwrap_or_else(|| "unspecified failure".to_string()))
                }
                _ => None,
            };
        }
        tracing::debug!(session = %id, ?status, "session status changed");
        self.notify();
    }

    /// Shorthand for moving a session to [`TransferStatus::Error`].
    pub fn fail(&self, id: SessionId, message: impl Into<String>) {
        self.set_status(id, TransferStatus::Error, Some(message.into()));
    }

    /// Record cumulative progress for a transferring session.
    ///
    /// # Panics
    ///
    /// If `transferred` goes backwards, exceeds the declared size, or the
    /// session is not transferring.
    pub fn advance(&self, id: SessionId, transferred: u64) {
        let Some(entry) = self.entry(id) else {
            tracing::warn!(session = %id, transferred, "progress on unknown session ignored");
            return;
        };
        {
            let mut session = entry.lock().expect("session poisoned");
            let previous = session.transferred;
            let size = session.size;
            let status = session.status;
            if status != TransferStatus::Transferring || transferred < previous || transferred > size
            {
                drop(session);
                panic!(
                    "invalid progress {transferred} for session {id} \
                     ({status:?}, previously {previous} of {size})"
                );
            }
            session.transferred = transferred;
        }
        self.notify();
    }

    /// Copy of one session, if it is still registered.
    pub fn get(&self, id: SessionId) -> Option<TransferSession> {
        self.entry(id)
            .map(|entry| entry.lock().expect("session poisoned").clone())
    }

    /// Copy of every session, oldest first.
    pub fn snapshot(&self) -> Vec<TransferSession> {
        let entries: Vec<_> = self
            .sessions
            .read()
            .expect("session table poisoned")
            .values()
            .cloned()
            .collect();
        let mut sessions: Vec<_> = entries
            .iter()
            .map(|entry| entry.lock().expect("session poisoned").clone())
            .collect();
        sessions.sort_by_key(|s| s.seq);
        sessions
    }

    /// Forget a session, returning its last state.
    pub fn remove(&self, id: SessionId) -> Option<TransferSession> {
        let removed = self
            .sessions
            .write()
            .expect("session table poisoned")
            .remove(&id)?;
        let session = removed.lock().expect("session poisoned").clone();
        tracing::debug!(session = %id, "session removed");
        self.notify();
        Some(session)
    }

    /// Drop every session in a terminal state. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let removed = {
            let mut sessions = self.sessions.write().expect("session table poisoned");
            let before = sessions.len();
            sessions.retain(|_, entry| !entry.lock().expect("session poisoned").status.is_terminal());
            before - sessions.len()
        };
        if removed > 0 {
            tracing::debug!(removed, "finished sessions cleared");
            self.notify();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change counter that ticks on every registry mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn entry(&self, id: SessionId) -> Option<Arc<Mutex<TransferSession>>> {
        self.sessions
            .read()
            .expect("session table poisoned")
            .get(&id)
            .cloned()
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_parses_its_display_form() {
        let id = SessionId::new();
        assert_eq!(SessionId::parse(&id.to_string()), Some(id));
        assert_eq!(SessionId::parse("thesis"), None);
    }

    #[test]
    fn send_session_lifecycle() {
        let registry = TransferRegistry::new();
        let id = registry.create(Direction::Send, "report.pdf", 100);

        let s = registry.get(id).unwrap();
        assert_eq!(s.status, TransferStatus::Pending);
        assert_eq!(s.transferred, 0);
        assert_eq!(s.error, None);

        registry.set_status(id, TransferStatus::Transferring, None);
        registry.advance(id, 40);
        registry.advance(id, 100);
        registry.set_status(id, TransferStatus::Completed, None);

        let s = registry.get(id).unwrap();
        assert_eq!(s.status, TransferStatus::Completed);
        assert_eq!(s.transferred, 100);
    }

    #[test]
    fn receive_session_described_after_header() {
        let registry = TransferRegistry::new();
        let id = registry.create(Direction::Receive, "", 0);
        registry.describe(id, "photo.jpg", 2048);

        let s = registry.get(id).unwrap();
        assert_eq!(s.filename, "photo.jpg");
        assert_eq!(s.size, 2048);
        assert_eq!(s.status, TransferStatus::Pending);
    }

    #[test]
    #[should_panic(expected = "cannot be described")]
    fn describe_twice_panics() {
        let registry = TransferRegistry::new();
        let id = registry.create(Direction::Receive, "", 0);
        registry.describe(id, "a", 1);
        registry.describe(id, "b", 2);
    }

    #[test]
    fn error_carries_message_and_can_skip_transferring() {
        let registry = TransferRegistry::new();
        let id = registry.create(Direction::Receive, "", 0);
        registry.fail(id, "malformed metadata");

        let s = registry.get(id).unwrap();
        assert_eq!(s.status, TransferStatus::Error);
        assert_eq!(s.error.as_deref(), Some("malformed metadata"));
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn completed_is_terminal() {
        let registry = TransferRegistry::new();
        let id = registry.create(Direction::Send, "a", 0);
        registry.set_status(id, TransferStatus::Transferring, None);
        registry.set_status(id, TransferStatus::Completed, None);
        registry.set_status(id, TransferStatus::Transferring, None);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn pending_cannot_complete_directly() {
        let registry = TransferRegistry::new();
        let id = registry.create(Direction::Send, "a", 0);
        registry.set_status(id, TransferStatus::Completed, None);
    }

    #[test]
    #[should_panic(expected = "invalid progress")]
    fn progress_cannot_go_backwards() {
        let registry = TransferRegistry::new();
        let id = registry.create(Direction::Send, "a", 10);
        registry.set_status(id, TransferStatus::Transferring, None);
        registry.advance(id, 6);
        registry.advance(id, 5);
    }

    #[test]
    #[should_panic(expected = "invalid progress")]
    fn progress_cannot_exceed_size() {
        let registry = TransferRegistry::new();
        let id = registry.create(Direction::Send, "a", 10);
        registry.set_status(id, TransferStatus::Transferring, None);
        registry.advance(id, 11);
    }

    #[test]
    fn updates_to_removed_session_are_ignored() {
        let registry = TransferRegistry::new();
        let id = registry.create(Direction::Send, "a", 10);
        assert!(registry.remove(id).is_some());

        registry.set_status(id, TransferStatus::Transferring, None);
        registry.advance(id, 5);
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_in_creation_order() {
        let registry = TransferRegistry::new();
        let ids: Vec<_> = (0..5)
            .map(|i| registry.create(Direction::Send, &format!("f{i}"), i))
            .collect();

        let names: Vec<_> = registry.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(names, ids);
    }

    #[test]
    fn clear_finished_keeps_active_sessions() {
        let registry = TransferRegistry::new();
        let done = registry.create(Direction::Send, "done", 0);
        registry.set_status(done, TransferStatus::Transferring, None);
        registry.set_status(done, TransferStatus::Completed, None);
        let failed = registry.create(Direction::Receive, "", 0);
        registry.fail(failed, "boom");
        let active = registry.create(Direction::Send, "active", 10);

        assert_eq!(registry.clear_finished(), 2);
        let remaining: Vec<_> = registry.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec![active]);
    }

    #[test]
    fn subscribers_see_changes() {
        let registry = TransferRegistry::new();
        let mut rx = registry.subscribe();
        assert!(!rx.has_changed().unwrap());

        let id = registry.create(Direction::Send, "a", 1);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        registry.set_status(id, TransferStatus::Transferring, None);
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn concurrent_updates_to_distinct_sessions() {
        let registry = Arc::new(TransferRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let id = registry.create(Direction::Send, "x", 1000);
                    registry.set_status(id, TransferStatus::Transferring, None);
                    for n in (0..=1000).step_by(100) {
                        registry.advance(id, n);
                    }
                    registry.set_status(id, TransferStatus::Completed, None);
                    id
                })
            })
            .collect();

        for handle in handles {
            let id = handle.join().unwrap();
            let s = registry.get(id).unwrap();
            assert_eq!(s.status, TransferStatus::Completed);
            assert_eq!(s.transferred, 1000);
        }
        assert_eq!(registry.len(), 8);
    }
}
