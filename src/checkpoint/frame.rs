//! Record framing (magic + length + crc32c) over the checkpoint file.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;

use crate::update::StatusUpdate;

use super::{CheckpointError, CheckpointRecord, CheckpointResult, MAX_RECORD_BYTES};

const FRAME_MAGIC: u32 = 0x5352_4C31; // "SRL1"
pub(crate) const FRAME_HEADER_LEN: usize = 12;

pub fn encode_frame<U: StatusUpdate>(record: &CheckpointRecord<U>) -> CheckpointResult<Vec<u8>> {
    let body = record.encode_body()?;
    if body.len() > MAX_RECORD_BYTES {
        return Err(CheckpointError::RecordTooLarge {
            max_bytes: MAX_RECORD_BYTES,
            got_bytes: body.len(),
        });
    }

    let length = u32::try_from(body.len()).map_err(|_| CheckpointError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;
    let crc = crc32c(&body);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Appends frames to the checkpoint file, syncing after every write so a
/// record is durable before its in-memory effect is applied.
#[derive(Debug)]
pub struct FrameWriter {
    file: File,
    path: PathBuf,
}

impl FrameWriter {
    pub fn new(file: File, path: PathBuf) -> Self {
        Self { file, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<U: StatusUpdate>(&mut self, record: &CheckpointRecord<U>) -> CheckpointResult<()> {
        let frame = encode_frame(record)?;
        self.file
            .write_all(&frame)
            .map_err(|source| self.io(source))?;
        self.file.sync_data().map_err(|source| self.io(source))?;
        Ok(())
    }

    pub fn sync_all(&self) -> CheckpointResult<()> {
        self.file.sync_all().map_err(|source| self.io(source))
    }

    fn io(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: Some(self.path.clone()),
            source,
        }
    }
}

/// Where the end of replay landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailState {
    /// EOF landed exactly on a frame boundary.
    Clean,
    /// EOF landed inside a frame: a torn write from an interrupted append.
    Torn,
}

/// Decodes frames one at a time, tracking the offset past the last good one.
pub struct FrameReader<R> {
    reader: R,
    offset: u64,
    tail: TailState,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            tail: TailState::Clean,
        }
    }

    /// Offset just past the last successfully decoded frame. Everything
    /// beyond it is torn or malformed and safe to truncate away.
    pub fn good_offset(&self) -> u64 {
        self.offset
    }

    pub fn tail(&self) -> TailState {
        self.tail
    }

    /// Decodes the next frame. `Ok(None)` ends replay: either a clean EOF or
    /// a torn tail (see [`FrameReader::tail`]). Malformed data is an error;
    /// in every case [`FrameReader::good_offset`] stays at the last frame
    /// boundary that decoded.
    pub fn read_next<U: StatusUpdate>(&mut self) -> CheckpointResult<Option<CheckpointRecord<U>>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.fill(&mut header)? {
            Fill::Empty => return Ok(None),
            Fill::Partial => {
                self.tail = TailState::Torn;
                return Ok(None);
            }
            Fill::Full => {}
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != FRAME_MAGIC {
            return Err(CheckpointError::FrameMagicMismatch { got: magic });
        }

        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length == 0 {
            return Err(CheckpointError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > MAX_RECORD_BYTES {
            return Err(CheckpointError::RecordTooLarge {
                max_bytes: MAX_RECORD_BYTES,
                got_bytes: length,
            });
        }

        let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let mut body = vec![0u8; length];
        match self.fill(&mut body)? {
            Fill::Full => {}
            Fill::Empty | Fill::Partial => {
                self.tail = TailState::Torn;
                return Ok(None);
            }
        }

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(CheckpointError::FrameCrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }

        let record = CheckpointRecord::decode_body(&body)?;
        self.offset += (FRAME_HEADER_LEN + length) as u64;
        Ok(Some(record))
    }

    fn fill(&mut self, buf: &mut [u8]) -> CheckpointResult<Fill> {
        let mut read = 0usize;
        while read < buf.len() {
            let n = self
                .reader
                .read(&mut buf[read..])
                .map_err(|source| CheckpointError::Io { path: None, source })?;
            if n == 0 {
                return Ok(if read == 0 { Fill::Empty } else { Fill::Partial });
            }
            read += n;
        }
        Ok(Fill::Full)
    }
}

enum Fill {
    Empty,
    Partial,
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::TestUpdate;
    use std::io::Cursor;
    use uuid::Uuid;

    fn update_frame(seed: u8) -> Vec<u8> {
        encode_frame(&CheckpointRecord::Update(TestUpdate::new(seed))).unwrap()
    }

    #[test]
    fn frame_roundtrip_reports_offsets() {
        let mut bytes = update_frame(1);
        let ack = encode_frame(&CheckpointRecord::<TestUpdate>::Ack {
            uuid: Uuid::from_bytes([1u8; 16]),
        })
        .unwrap();
        bytes.extend_from_slice(&ack);
        let total = bytes.len() as u64;

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let first = reader.read_next::<TestUpdate>().unwrap().unwrap();
        assert_eq!(first, CheckpointRecord::Update(TestUpdate::new(1)));
        assert_eq!(reader.good_offset(), total - ack.len() as u64);

        let second = reader.read_next::<TestUpdate>().unwrap().unwrap();
        assert!(matches!(second, CheckpointRecord::Ack { .. }));
        assert_eq!(reader.good_offset(), total);

        assert!(reader.read_next::<TestUpdate>().unwrap().is_none());
        assert_eq!(reader.tail(), TailState::Clean);
    }

    #[test]
    fn torn_tail_stops_at_last_good_frame() {
        let good = update_frame(2);
        let mut bytes = good.clone();
        let torn = update_frame(3);
        bytes.extend_from_slice(&torn[..torn.len() / 2]);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(reader.read_next::<TestUpdate>().unwrap().is_some());
        assert!(reader.read_next::<TestUpdate>().unwrap().is_none());
        assert_eq!(reader.tail(), TailState::Torn);
        assert_eq!(reader.good_offset(), good.len() as u64);
    }

    #[test]
    fn torn_header_is_not_an_error() {
        let mut bytes = update_frame(4);
        bytes.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        bytes.push(0xAB);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(reader.read_next::<TestUpdate>().unwrap().is_some());
        assert!(reader.read_next::<TestUpdate>().unwrap().is_none());
        assert_eq!(reader.tail(), TailState::Torn);
    }

    #[test]
    fn crc_mismatch_fails() {
        let mut bytes = update_frame(5);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_next::<TestUpdate>().unwrap_err();
        assert!(matches!(err, CheckpointError::FrameCrcMismatch { .. }));
        assert_eq!(reader.good_offset(), 0);
    }

    #[test]
    fn bad_magic_fails() {
        let mut bytes = update_frame(6);
        bytes[0] ^= 0xFF;

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_next::<TestUpdate>().unwrap_err();
        assert!(matches!(err, CheckpointError::FrameMagicMismatch { .. }));
    }

    #[test]
    fn oversized_length_fails() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&(MAX_RECORD_BYTES as u32 + 1).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_next::<TestUpdate>().unwrap_err();
        assert!(matches!(err, CheckpointError::RecordTooLarge { .. }));
    }

    #[test]
    fn zero_length_fails() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_next::<TestUpdate>().unwrap_err();
        assert!(matches!(err, CheckpointError::FrameLengthInvalid { .. }));
    }
}
