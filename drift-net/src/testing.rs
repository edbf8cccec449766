//! Shared test utilities for drift integration tests.
//!
//! Available behind the `test-util` feature or in `#[cfg(test)]` within drift-net.

use std::time::Duration;

use crate::connection::ConnectionKind;
use crate::sim::{SimNetwork, SimNode};

/// Poll interval used by [`wait_until`].
const POLL_INTERVAL_MS: u64 = 10;

/// Initialise a tracing subscriber for tests.
///
/// Respects the `RUST_LOG` environment variable, defaults to `debug`.
/// Uses `with_test_writer()` to integrate with `cargo test` output capture.
/// Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Timing instrumentation for test phases.
///
/// Records wall-clock duration of each named phase and logs a summary
/// on drop.
pub struct TestTimer {
    test_name: String,
    start: std::time::Instant,
    last: std::time::Instant,
    phases: Vec<(String, Duration)>,
}

impl TestTimer {
    /// Create a new timer for a test.
    pub fn new(test_name: &str) -> Self {
        let now = std::time::Instant::now();
        tracing::info!(target: "drift_test::timer", test = test_name, "test started");
        Self {
            test_name: test_name.to_string(),
            start: now,
            last: now,
            phases: Vec::new(),
        }
    }

    /// Record the end of a named phase.
    pub fn phase(&mut self, name: &str) {
        let now = std::time::Instant::now();
        let duration = now - self.last;
        tracing::info!(
            target: "drift_test::timer",
            test = %self.test_name,
            phase = name,
            duration_ms = duration.as_millis() as u64,
            elapsed_ms = (now - self.start).as_millis() as u64,
            "phase complete"
        );
        self.phases.push((name.to_string(), duration));
        self.last = now;
    }
}

impl Drop for TestTimer {
    fn drop(&mut self) {
        tracing::info!(
            target: "drift_test::timer",
            test = %self.test_name,
            total_ms = self.start.elapsed().as_millis() as u64,
            phase_count = self.phases.len(),
            "test timing summary"
        );
    }
}

/// Create two nodes joined by a single link of the given kind.
pub fn linked_pair(sim: &SimNetwork, kind: ConnectionKind) -> (SimNode, SimNode) {
    let a = sim.create_node("alice");
    let b = sim.create_node("bob");
    sim.link(&a, &b, kind);
    (a, b)
}

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns `true` if the condition was met.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}
