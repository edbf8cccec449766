//! Shared types, wire formats, and the framing codec for drift.

pub mod file;
pub mod frame;
pub mod types;

pub use file::{FileHeader, CHUNK_SIZE, FILE_PROTOCOL, MAX_HEADER_LEN};
pub use frame::FrameError;
pub use types::PeerId;
