//! Append-only checkpoint log: record codec and frame I/O.

use std::path::PathBuf;

use thiserror::Error;

use crate::update::PayloadCodecError;

pub mod frame;
pub mod record;

pub use frame::{FrameReader, FrameWriter, TailState, encode_frame};
pub use record::{CheckpointRecord, RecordKind};

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Frame bodies larger than this are treated as corruption: a torn length
/// field must not make the reader allocate or skip past gigabytes.
pub const MAX_RECORD_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("frame magic mismatch: got {got:#x}")]
    FrameMagicMismatch { got: u32 },
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("record exceeds max bytes {max_bytes} (got {got_bytes})")]
    RecordTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("frame crc32c mismatch: expected {expected:#x}, got {got:#x}")]
    FrameCrcMismatch { expected: u32, got: u32 },
    #[error("record tag invalid: got {got}")]
    RecordTagInvalid { got: u8 },
    #[error("record body truncated")]
    RecordTruncated,
    #[error("failed to encode update payload: {source}")]
    PayloadEncode {
        #[source]
        source: PayloadCodecError,
    },
    #[error("failed to decode update payload: {source}")]
    PayloadDecode {
        #[source]
        source: PayloadCodecError,
    },
}
