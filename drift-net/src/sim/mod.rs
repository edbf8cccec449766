//! Deterministic in-process substrate for testing.
//!
//! Provides [`SimNetwork`] to create simulated nodes that exchange protocol
//! streams over `tokio::io::DuplexStream` pairs, with configurable connect
//! latency, stream-open delay, relayed links, and disconnection. All tests
//! run without real sockets.
//!
//! # Example
//!
//! ```ignore
//! let sim = SimNetwork::new();
//! let alice = sim.create_node("alice");
//! let bob = sim.create_node("bob");
//! sim.link(&alice, &bob, ConnectionKind::Direct);
//!
//! bob.handle(PROTO, handler)?;
//! let conn = alice.connections(&bob.local_id())[0].clone();
//! let stream = alice.open_stream(&conn, PROTO).await?;
//! ```

mod network;
mod node;

pub use network::SimNetwork;
pub use node::SimNode;
