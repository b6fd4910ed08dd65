//! Per-stream status update state machine and checkpoint replay.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointRecord, FrameReader, FrameWriter};
use crate::update::StatusUpdate;

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("status update is missing a status uuid")]
    MissingUuid,
    #[error("unexpected status update acknowledgement (uuid {uuid}) for stream {stream}")]
    UnexpectedAck { stream: String, uuid: Uuid },
    #[error("stream {stream} previously failed: {message}")]
    Sticky { stream: String, message: String },
    #[error("the status updates file {path:?} already exists")]
    CheckpointExists { path: PathBuf },
    #[error("failed to create checkpoint directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open status updates file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to checkpoint record: {source}")]
    Append {
        #[source]
        source: CheckpointError,
    },
    #[error("failed to replay status updates file {path:?}: {source}")]
    Replay {
        path: PathBuf,
        #[source]
        source: CheckpointError,
    },
    #[error("failed to truncate status updates file {path:?}: {source}")]
    Truncate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove status updates file {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// State replayed from a stream's checkpoint file: every update record in
/// log order (acknowledged ones included) and whether a terminal update was
/// acknowledged. `error` is set when non-strict recovery dropped a malformed
/// tail.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveredStream<U> {
    pub updates: Vec<U>,
    pub terminated: bool,
    pub error: bool,
}

impl<U> Default for RecoveredStream<U> {
    fn default() -> Self {
        Self {
            updates: Vec::new(),
            terminated: false,
            error: false,
        }
    }
}

/// One update stream: dedup sets, the pending retry queue, the terminal
/// flag, and the optional checkpoint file.
#[derive(Debug)]
pub struct UpdateStream<S, U: StatusUpdate> {
    id: S,
    framework_id: Option<U::FrameworkId>,
    path: Option<PathBuf>,
    writer: Option<FrameWriter>,
    received: HashSet<Uuid>,
    acknowledged: HashSet<Uuid>,
    pending: VecDeque<U>,
    terminated: bool,
    /// Deadline of the armed retry timer, if any.
    pub(crate) timeout: Option<Instant>,
    error: Option<String>,
}

impl<S, U> UpdateStream<S, U>
where
    S: fmt::Display,
    U: StatusUpdate,
{
    /// Creates a new stream. With a path, the checkpoint file is created
    /// up front (failing if it already exists) so recovery can tell an
    /// interrupted initial checkpoint from a stream that never existed.
    pub fn create(
        id: S,
        framework_id: Option<U::FrameworkId>,
        path: Option<PathBuf>,
    ) -> StreamResult<Self> {
        let writer = match &path {
            Some(path) => {
                if path.exists() {
                    return Err(StreamError::CheckpointExists { path: path.clone() });
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|source| StreamError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                let file = OpenOptions::new()
                    .create_new(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| StreamError::Open {
                        path: path.clone(),
                        source,
                    })?;
                Some(FrameWriter::new(file, path.clone()))
            }
            None => None,
        };

        Ok(Self {
            id,
            framework_id,
            path,
            writer,
            received: HashSet::new(),
            acknowledged: HashSet::new(),
            pending: VecDeque::new(),
            terminated: false,
            timeout: None,
            error: None,
        })
    }

    /// Rebuilds a stream from its checkpoint file.
    ///
    /// Returns `None` when the file does not exist (the initial checkpoint
    /// never started) or holds no complete update record (it was interrupted
    /// mid-write; the file is removed). The file is always truncated to the
    /// last good frame; a malformed tail beyond that is fatal iff `strict`.
    pub fn recover(
        id: S,
        path: PathBuf,
        strict: bool,
    ) -> StreamResult<Option<(Self, RecoveredStream<U>)>> {
        let parent_exists = path.parent().is_none_or(|parent| parent.exists());
        if parent_exists && !path.exists() {
            // The process died before it checkpointed any records.
            return Ok(None);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| StreamError::Open {
                path: path.clone(),
                source,
            })?;

        let mut stream = Self {
            id,
            framework_id: None,
            path: Some(path.clone()),
            writer: None,
            received: HashSet::new(),
            acknowledged: HashSet::new(),
            pending: VecDeque::new(),
            terminated: false,
            timeout: None,
            error: None,
        };
        let mut state = RecoveredStream::default();

        debug!(stream = %stream.id, "replaying status updates file");

        let (good_offset, corrupt) = {
            let mut reader = FrameReader::new(&mut file);
            let mut corrupt = None;
            loop {
                match reader.read_next::<U>() {
                    Ok(Some(CheckpointRecord::Update(update))) => {
                        stream.apply_update(&update);
                        state.updates.push(update);
                    }
                    Ok(Some(CheckpointRecord::Ack { uuid })) => {
                        let Some(head) = stream.pending.front().cloned() else {
                            return Err(StreamError::UnexpectedAck {
                                stream: stream.id.to_string(),
                                uuid,
                            });
                        };
                        stream.apply_ack(&head);
                    }
                    Ok(None) => break,
                    Err(source) => {
                        corrupt = Some(source);
                        break;
                    }
                }
            }
            (reader.good_offset(), corrupt)
        };

        // The tail beyond the last decodable frame is either a torn write or
        // unreachable, so dropping it is crash-idempotent.
        file.set_len(good_offset)
            .map_err(|source| StreamError::Truncate {
                path: path.clone(),
                source,
            })?;
        file.sync_all().map_err(|source| StreamError::Truncate {
            path: path.clone(),
            source,
        })?;
        file.seek(SeekFrom::Start(good_offset))
            .map_err(|source| StreamError::Truncate {
                path: path.clone(),
                source,
            })?;

        if let Some(source) = corrupt {
            if strict {
                return Err(StreamError::Replay {
                    path: path.clone(),
                    source,
                });
            }
            warn!(
                stream = %stream.id,
                path = ?path,
                "status updates file has a malformed tail: {source}"
            );
            state.error = true;
        }

        if state.updates.is_empty() {
            // A stream is created only once there is something to write to
            // it, so the checkpointing of the first update was interrupted.
            fs::remove_file(&path).map_err(|source| StreamError::Remove {
                path: path.clone(),
                source,
            })?;
            return Ok(None);
        }

        state.terminated = stream.terminated;
        stream.writer = Some(FrameWriter::new(file, path));
        Ok(Some((stream, state)))
    }

    /// Handles an incoming update, checkpointing it first when the stream is
    /// checkpointed.
    ///
    /// Returns `false` when the update is a duplicate or was already
    /// acknowledged (dropped, not an error).
    pub fn update(&mut self, update: &U) -> StreamResult<bool> {
        self.check_sticky()?;

        let uuid = update.status_uuid().ok_or(StreamError::MissingUuid)?;

        if self.acknowledged.contains(&uuid) {
            warn!(
                stream = %self.id,
                uuid = %uuid,
                "ignoring status update that has already been acknowledged"
            );
            return Ok(false);
        }
        if self.received.contains(&uuid) {
            warn!(stream = %self.id, uuid = %uuid, "ignoring duplicate status update");
            return Ok(false);
        }

        self.checkpoint(&CheckpointRecord::Update(update.clone()))?;
        self.apply_update(update);
        Ok(true)
    }

    /// Handles an acknowledgement, checkpointing it first when the stream is
    /// checkpointed.
    ///
    /// Returns `false` when the ack is a duplicate or does not match the
    /// head of the queue (a retried update can come back with acks for both
    /// the original and the retry).
    pub fn acknowledgement(&mut self, uuid: Uuid) -> StreamResult<bool> {
        self.check_sticky()?;

        let Some(head) = self.pending.front().cloned() else {
            return Err(StreamError::UnexpectedAck {
                stream: self.id.to_string(),
                uuid,
            });
        };

        if self.acknowledged.contains(&uuid) {
            warn!(stream = %self.id, uuid = %uuid, "duplicate status update acknowledgement");
            return Ok(false);
        }

        let head_uuid = head.status_uuid().ok_or(StreamError::MissingUuid)?;
        if uuid != head_uuid {
            warn!(
                stream = %self.id,
                received = %uuid,
                expecting = %head_uuid,
                "unexpected status update acknowledgement"
            );
            return Ok(false);
        }

        self.checkpoint(&CheckpointRecord::Ack { uuid })?;
        self.apply_ack(&head);
        Ok(true)
    }

    /// The update currently being retried, if any.
    pub fn next(&self) -> Option<&U> {
        self.pending.front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn checkpointed(&self) -> bool {
        self.path.is_some()
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    pub fn framework_id(&self) -> Option<&U::FrameworkId> {
        self.framework_id.as_ref()
    }

    /// Whether a checkpoint write failed; a failed stream refuses further
    /// mutations with the same error.
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    fn check_sticky(&self) -> StreamResult<()> {
        match &self.error {
            Some(message) => Err(StreamError::Sticky {
                stream: self.id.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn checkpoint(&mut self, record: &CheckpointRecord<U>) -> StreamResult<()> {
        debug_assert!(self.error.is_none());
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        debug!(stream = %self.id, kind = ?record.kind(), "checkpointing record");
        if let Err(source) = writer.append(record) {
            let err = StreamError::Append { source };
            self.error = Some(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    fn apply_update(&mut self, update: &U) {
        debug_assert!(update.status_uuid().is_some());
        if self.framework_id.is_none() {
            self.framework_id = update.framework_id();
        }
        if let Some(uuid) = update.status_uuid() {
            self.received.insert(uuid);
        }
        self.pending.push_back(update.clone());
    }

    fn apply_ack(&mut self, update: &U) {
        if let Some(uuid) = update.status_uuid() {
            self.acknowledged.insert(uuid);
        }
        self.pending.pop_front();
        if !self.terminated {
            self.terminated = update.is_terminal();
        }
    }
}

impl<S, U: StatusUpdate> Drop for UpdateStream<S, U> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take()
            && let Err(err) = writer.sync_all()
        {
            warn!(path = ?self.path, "failed to close status updates file: {err}");
        }
    }
}
