//! Error kinds recorded against failed transfer sessions.

use std::io;
use std::time::Duration;

use drift_net::NetError;
use drift_protocol::{FrameError, PeerId};
use thiserror::Error;

use crate::spool::SpoolError;

/// Why a transfer session failed.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),
    #[error("stream closed after {received} of {expected} payload bytes")]
    StreamClosedEarly { expected: u64, received: u64 },
    #[error("timed out connecting to {peer} after {timeout:?}")]
    DialTimeout { peer: PeerId, timeout: Duration },
    #[error("timed out opening transfer stream to {peer} after {timeout:?}")]
    HandshakeTimeout { peer: PeerId, timeout: Duration },
    #[error("storage unavailable: {0}")]
    StorageAcquisitionFailed(#[source] SpoolError),
    #[error("storage write failed: {0}")]
    StorageWriteFailure(#[source] SpoolError),
    #[error("declared size {size} exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("source ended after {produced} of {expected} bytes")]
    SourceTruncated { expected: u64, produced: u64 },
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("stream I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for TransferError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::HeaderTooLarge { .. } | FrameError::TruncatedHeader { .. } => {
                Self::ProtocolViolation(e.to_string())
            }
            FrameError::MalformedMetadata(msg) => Self::MalformedMetadata(msg),
            FrameError::StreamClosedEarly { expected, received } => {
                Self::StreamClosedEarly { expected, received }
            }
            FrameError::SourceTruncated { expected, produced } => {
                Self::SourceTruncated { expected, produced }
            }
            FrameError::Io(e) => Self::Io(e),
        }
    }
}
