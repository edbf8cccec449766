//! Connection substrate, in-process simulation, and short-code address registry.

pub mod codes;
pub mod connection;
pub mod sim;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;

pub use codes::{CodeError, CodeRegistry, CODE_TTL};
pub use connection::{select_connection, ConnectionId, ConnectionInfo, ConnectionKind};
pub use transport::{HandlerFuture, Inbound, NetError, StreamHandler, Substrate, TransportMetrics};
