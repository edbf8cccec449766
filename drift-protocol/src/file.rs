//! File transfer protocol constants and header metadata.

use serde::{Deserialize, Serialize};

/// Protocol identifier the file transfer handler is registered under.
pub const FILE_PROTOCOL: &str = "/drift/file-transfer/1.0.0";

/// Payload chunk size: 64KB.
pub const CHUNK_SIZE: usize = 65_536;

/// Largest accepted header metadata length in bytes.
pub const MAX_HEADER_LEN: u32 = 10_000;

/// Metadata sent ahead of the payload: `{"filename": ..., "size": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub filename: String,
    pub size: u64,
}

impl FileHeader {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            size,
        }
    }

    /// Serialize to the UTF-8 JSON form used on the wire.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the UTF-8 JSON form used on the wire.
    ///
    /// `size` must be a non-negative integer; floats, negatives, and strings
    /// are rejected. Unknown fields are ignored.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
