//! Short numeric codes standing in for peer addresses.
//!
//! A sender registers its substrate address and reads a six-digit code to
//! the receiver, who looks the address up. Entries expire [`CODE_TTL`] after
//! creation; expiry is checked lazily on lookup and by a periodic sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lifetime of a registered code.
pub const CODE_TTL: Duration = Duration::from_secs(5 * 60);

/// Number of decimal digits in a code.
const CODE_DIGITS: usize = 6;

/// Attempts at drawing an unused code before giving up.
const MAX_DRAW_ATTEMPTS: usize = 64;

/// Errors when registering an address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("address must not be empty")]
    EmptyAddress,
    #[error("no free code after {0} attempts")]
    Exhausted(usize),
}

#[derive(Debug, Clone)]
struct CodeEntry {
    address: String,
    created: Instant,
}

/// In-memory map from short code to address with a fixed time-to-live.
#[derive(Debug)]
pub struct CodeRegistry {
    ttl: Duration,
    entries: Mutex<HashMap<String, CodeEntry>>,
}

impl CodeRegistry {
    /// Create a registry using the default [`CODE_TTL`].
    pub fn new() -> Self {
        Self::with_ttl(CODE_TTL)
    }

    /// Create a registry with a custom time-to-live.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `address` under a fresh code and return the code.
    pub fn register(&self, address: &str) -> Result<String, CodeError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(CodeError::EmptyAddress);
        }

        let now = Instant::now();
        let mut entries = self.entries.lock().expect("code registry lock poisoned");
        let mut rng = rand::rng();

        for _ in 0..MAX_DRAW_ATTEMPTS {
            let code = format!(
                "{:0width$}",
                rng.random_range(0..10u32.pow(CODE_DIGITS as u32)),
                width = CODE_DIGITS
            );
            let taken = entries
                .get(&code)
                .is_some_and(|entry| !self.is_expired(entry, now));
            if taken {
                continue;
            }

            entries.insert(
                code.clone(),
                CodeEntry {
                    address: address.to_string(),
                    created: now,
                },
            );
            tracing::info!(code = %code, "address registered");
            return Ok(code);
        }

        tracing::warn!(live = entries.len(), "code space exhausted");
        Err(CodeError::Exhausted(MAX_DRAW_ATTEMPTS))
    }

    /// Look up the address for `code`, removing the entry if it has expired.
    pub fn lookup(&self, code: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("code registry lock poisoned");
        let entry = entries.get(code.trim())?;
        if self.is_expired(entry, now) {
            entries.remove(code.trim());
            tracing::debug!(code, "code expired on lookup");
            return None;
        }
        Some(entry.address.clone())
    }

    /// Remove every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("code registry lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = entries.len(), "swept expired codes");
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("code registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep every `interval` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    tracing::debug!("code registry dropped, sweeper exiting");
                    break;
                };
                registry.sweep();
            }
        })
    }

    fn is_expired(&self, entry: &CodeEntry, now: Instant) -> bool {
        now.duration_since(entry.created) >= self.ttl
    }
}

impl Default for CodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
