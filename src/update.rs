//! Embedder-facing contract for status update payloads.

use std::fmt;
use std::hash::Hash;

use bytes::Bytes;
use uuid::Uuid;

/// Error produced by an embedder's payload codec.
pub type PayloadCodecError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A status update as seen by the manager.
///
/// The payload shape is the embedder's; the manager only needs the three
/// accessors below plus a byte-level codec for checkpointing. The codec must
/// round-trip: `decode_payload(encode_payload(u)) == u`, including the status
/// uuid, since recovery rebuilds the dedup sets from decoded payloads.
pub trait StatusUpdate: Clone + fmt::Debug {
    /// Identifier of the producer group owning the update's stream.
    type FrameworkId: Clone + Eq + Hash + fmt::Debug;

    /// 128-bit identifier of this update attempt. Updates without one are
    /// rejected; the uuid is the sole key for dedup and ack matching.
    fn status_uuid(&self) -> Option<Uuid>;

    fn framework_id(&self) -> Option<Self::FrameworkId>;

    /// Whether this update represents a terminal lifecycle state. The
    /// acknowledgement of a terminal update closes its stream.
    fn is_terminal(&self) -> bool;

    fn encode_payload(&self) -> Result<Bytes, PayloadCodecError>;

    fn decode_payload(bytes: &[u8]) -> Result<Self, PayloadCodecError>;
}
