//! Checkpoint record codec (tag byte + payload body).

use uuid::Uuid;

use crate::update::StatusUpdate;

use super::{CheckpointError, CheckpointResult};

const TAG_UPDATE: u8 = 1;
const TAG_ACK: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Update,
    Ack,
}

/// One entry of a stream's checkpoint log: either a full status update or
/// the acknowledgement of one.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckpointRecord<U> {
    Update(U),
    Ack { uuid: Uuid },
}

impl<U: StatusUpdate> CheckpointRecord<U> {
    pub fn kind(&self) -> RecordKind {
        match self {
            CheckpointRecord::Update(_) => RecordKind::Update,
            CheckpointRecord::Ack { .. } => RecordKind::Ack,
        }
    }

    pub fn encode_body(&self) -> CheckpointResult<Vec<u8>> {
        match self {
            CheckpointRecord::Update(update) => {
                let payload = update
                    .encode_payload()
                    .map_err(|source| CheckpointError::PayloadEncode { source })?;
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(TAG_UPDATE);
                buf.extend_from_slice(&payload);
                Ok(buf)
            }
            CheckpointRecord::Ack { uuid } => {
                let mut buf = Vec::with_capacity(1 + 16);
                buf.push(TAG_ACK);
                buf.extend_from_slice(uuid.as_bytes());
                Ok(buf)
            }
        }
    }

    pub fn decode_body(body: &[u8]) -> CheckpointResult<Self> {
        let (&tag, payload) = body
            .split_first()
            .ok_or(CheckpointError::RecordTruncated)?;
        match tag {
            TAG_UPDATE => {
                let update = U::decode_payload(payload)
                    .map_err(|source| CheckpointError::PayloadDecode { source })?;
                Ok(CheckpointRecord::Update(update))
            }
            TAG_ACK => {
                let bytes: [u8; 16] = payload
                    .try_into()
                    .map_err(|_| CheckpointError::RecordTruncated)?;
                Ok(CheckpointRecord::Ack {
                    uuid: Uuid::from_bytes(bytes),
                })
            }
            got => Err(CheckpointError::RecordTagInvalid { got }),
        }
    }
}
