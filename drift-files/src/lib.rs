//! Transfer sessions, storage spool, and the sender/receiver pipelines.

pub mod error;
pub mod inbox;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod service;
pub mod spool;

pub use error::TransferError;
pub use inbox::{Inbox, ReceivedFile};
pub use receiver::{FileReceiver, ReceiveLimits};
pub use registry::{Direction, SessionId, TransferRegistry, TransferSession, TransferStatus};
pub use sender::{FileSender, Timeouts};
pub use service::{FileService, ServiceConfig};
pub use spool::{Blob, Spool, SpoolConfig, SpoolError, SpoolTarget};
