//! Status update manager: stream routing, retries, recovery, and cleanup.
//!
//! The manager reliably forwards status updates, optionally checkpointing
//! them to disk, receives acknowledgements, and recovers checkpointed
//! streams after a failover. Unless paused, it forwards updates as soon as
//! possible: during recovery, or as soon as the first update of a stream is
//! processed.
//!
//! The manager does not garbage collect checkpointed state; its users are
//! responsible for removing the files of cleaned-up streams.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::retry::{RetryPolicy, RetryTimers};
use crate::stream::{RecoveredStream, StreamError, UpdateStream};
use crate::update::StatusUpdate;

/// Called whenever an update must be (re)sent to the consumer. Fire and
/// forget: success is signalled only by a later acknowledgement, and the
/// sink must not block.
pub type ForwardFn<U> = Box<dyn FnMut(&U) + Send>;

/// Resolves the checkpoint file path of a stream. Must be deterministic so
/// that recovery finds the same file; intermediate directories are created
/// by the manager.
pub type PathFn<S> = Box<dyn Fn(&S) -> PathBuf + Send>;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cannot find the status update stream {stream}")]
    UnknownStream { stream: String },
    #[error(
        "mismatched checkpoint flag for stream {stream} (expected checkpoint={expected}, actual checkpoint={actual})"
    )]
    CheckpointMismatch {
        stream: String,
        expected: bool,
        actual: bool,
    },
    #[error("mismatched framework id for stream {stream} (expected {expected}, got {got})")]
    FrameworkMismatch {
        stream: String,
        expected: String,
        got: String,
    },
    #[error("duplicate status update acknowledgement for stream {stream}")]
    DuplicateAck { stream: String },
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed to recover status update stream {stream}: {source}")]
    Recover {
        stream: String,
        #[source]
        source: StreamError,
    },
}

/// Replayed state of one recovered stream, as reported to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamState<U> {
    pub updates: Vec<U>,
    pub terminated: bool,
}

/// Result of [`StatusUpdateManager::recover`]: the replayed state per stream
/// (`None` when the stream's initial checkpoint never completed) and the
/// number of recoverable errors seen in non-strict mode.
#[derive(Debug)]
pub struct RecoveredState<S, U> {
    pub streams: HashMap<S, Option<StreamState<U>>>,
    pub errors: u32,
}

impl<S, U> Default for RecoveredState<S, U> {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
            errors: 0,
        }
    }
}

pub struct StatusUpdateManager<S, U: StatusUpdate> {
    forward: ForwardFn<U>,
    path_for: PathFn<S>,
    retry: RetryPolicy,
    streams: HashMap<S, UpdateStream<S, U>>,
    framework_streams: HashMap<U::FrameworkId, HashSet<S>>,
    timers: RetryTimers<S>,
    paused: bool,
}

impl<S, U> StatusUpdateManager<S, U>
where
    S: Clone + Eq + Hash + fmt::Display,
    U: StatusUpdate,
{
    pub fn new(config: &ManagerConfig, forward: ForwardFn<U>, path_for: PathFn<S>) -> Self {
        Self {
            forward,
            path_for,
            retry: config.retry_policy(),
            streams: HashMap::new(),
            framework_streams: HashMap::new(),
            timers: RetryTimers::new(),
            paused: false,
        }
    }

    /// Accepts an update on the given stream, creating the stream on first
    /// use, and forwards it immediately if it lands at the head of the queue.
    ///
    /// A duplicate update is dropped and reported as success.
    pub fn update(&mut self, update: &U, stream_id: &S, checkpoint: bool) -> ManagerResult<()> {
        self.update_at(update, stream_id, checkpoint, Instant::now())
    }

    pub fn update_at(
        &mut self,
        update: &U,
        stream_id: &S,
        checkpoint: bool,
        now: Instant,
    ) -> ManagerResult<()> {
        info!(stream = %stream_id, "received status update");

        let stream = match self.streams.entry(stream_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(stream = %stream_id, checkpoint, "creating status update stream");
                let path = checkpoint.then(|| (self.path_for)(stream_id));
                let stream = UpdateStream::create(stream_id.clone(), update.framework_id(), path)?;
                if let Some(framework_id) = update.framework_id() {
                    self.framework_streams
                        .entry(framework_id)
                        .or_default()
                        .insert(stream_id.clone());
                }
                entry.insert(stream)
            }
        };

        if stream.checkpointed() != checkpoint {
            return Err(ManagerError::CheckpointMismatch {
                stream: stream_id.to_string(),
                expected: stream.checkpointed(),
                actual: checkpoint,
            });
        }

        let update_framework = update.framework_id();
        if update_framework.is_some() != stream.framework_id().is_some()
            || (update_framework.is_some() && update_framework.as_ref() != stream.framework_id())
        {
            return Err(ManagerError::FrameworkMismatch {
                stream: stream_id.to_string(),
                expected: format!("{:?}", stream.framework_id()),
                got: format!("{:?}", update_framework),
            });
        }

        if !stream.update(update)? {
            // Duplicate: dropped by the stream, nothing to forward.
            return Ok(());
        }

        // Forward if this update is at the front of the queue; later ones
        // are sent by `acknowledgement`.
        let arm = !self.paused && stream.pending_len() == 1;
        if arm {
            debug_assert!(stream.timeout.is_none());
            let interval = self.retry.initial;
            self.forward_head_at(stream_id, interval, now);
        }
        Ok(())
    }

    /// Processes the acknowledgement of a stream's head update and forwards
    /// the next queued one.
    ///
    /// Returns `true` iff the stream is still alive afterwards; the ack of a
    /// terminal update cleans the stream up and returns `false`.
    pub fn acknowledgement(&mut self, stream_id: &S, uuid: Uuid) -> ManagerResult<bool> {
        self.acknowledgement_at(stream_id, uuid, Instant::now())
    }

    pub fn acknowledgement_at(
        &mut self,
        stream_id: &S,
        uuid: Uuid,
        now: Instant,
    ) -> ManagerResult<bool> {
        info!(stream = %stream_id, uuid = %uuid, "received status update acknowledgement");

        // The stream may not have been recovered yet, or was cleaned up.
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Err(ManagerError::UnknownStream {
                stream: stream_id.to_string(),
            });
        };

        if !stream.acknowledgement(uuid)? {
            return Err(ManagerError::DuplicateAck {
                stream: stream_id.to_string(),
            });
        }

        stream.timeout = None;

        let terminated = stream.terminated();
        let has_next = stream.next().is_some();
        if terminated {
            if has_next {
                warn!(
                    stream = %stream_id,
                    "acknowledged a terminal status update but updates are still pending"
                );
            }
            self.cleanup_stream(stream_id);
        } else if !self.paused && has_next {
            let interval = self.retry.initial;
            self.forward_head_at(stream_id, interval, now);
        }

        Ok(!terminated)
    }

    /// Recovers the checkpointed streams with the given ids.
    ///
    /// In strict mode the first unrecoverable stream tears down everything
    /// already recovered and fails; otherwise failures are counted and
    /// recovery continues. Heads of recovered queues are forwarded unless
    /// paused.
    pub fn recover(&mut self, stream_ids: Vec<S>, strict: bool) -> ManagerResult<RecoveredState<S, U>> {
        self.recover_at(stream_ids, strict, Instant::now())
    }

    pub fn recover_at(
        &mut self,
        stream_ids: Vec<S>,
        strict: bool,
        now: Instant,
    ) -> ManagerResult<RecoveredState<S, U>> {
        info!("recovering status update manager");

        let mut state = RecoveredState::default();
        for stream_id in stream_ids {
            match self.recover_stream(&stream_id, strict, now) {
                Err(err) => {
                    warn!(stream = %stream_id, "failed to recover status update stream: {err}");
                    if strict {
                        let stream_ids: Vec<S> = self.streams.keys().cloned().collect();
                        for stream_id in stream_ids {
                            self.cleanup_stream(&stream_id);
                        }
                        debug_assert!(self.streams.is_empty());
                        debug_assert!(self.framework_streams.is_empty());
                        return Err(err);
                    }
                    state.errors += 1;
                }
                Ok(None) => {
                    state.streams.insert(stream_id, None);
                }
                Ok(Some(recovered)) => {
                    if recovered.error {
                        state.errors += 1;
                    }
                    state.streams.insert(
                        stream_id,
                        Some(StreamState {
                            updates: recovered.updates,
                            terminated: recovered.terminated,
                        }),
                    );
                }
            }
        }
        Ok(state)
    }

    /// Closes every status update stream of the given framework. Pending
    /// updates stop being retried; checkpointed state stays on disk for the
    /// caller to garbage collect.
    pub fn cleanup(&mut self, framework_id: &U::FrameworkId) {
        info!(framework = ?framework_id, "closing status update streams for framework");

        let Some(stream_ids) = self.framework_streams.get(framework_id).cloned() else {
            return;
        };
        for stream_id in stream_ids {
            self.cleanup_stream(&stream_id);
        }
    }

    pub fn pause(&mut self) {
        info!("pausing sending status updates");
        self.paused = true;
        // An armed deadline implies a forward can still happen; clear them
        // so late timer firings are ignored until `resume` re-arms.
        for stream in self.streams.values_mut() {
            stream.timeout = None;
        }
    }

    pub fn resume(&mut self) {
        self.resume_at(Instant::now());
    }

    pub fn resume_at(&mut self, now: Instant) {
        info!("resuming sending status updates");
        self.paused = false;

        let stream_ids: Vec<S> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.next().is_some())
            .map(|(stream_id, _)| stream_id.clone())
            .collect();
        for stream_id in stream_ids {
            warn!(stream = %stream_id, "sending status update");
            let interval = self.retry.initial;
            self.forward_head_at(&stream_id, interval, now);
        }
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn contains_stream(&self, stream_id: &S) -> bool {
        self.streams.contains_key(stream_id)
    }

    /// Deadline of the soonest armed retry timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Dispatches every retry timer due at this instant.
    pub fn run_timers(&mut self) {
        self.run_timers_at(Instant::now());
    }

    pub fn run_timers_at(&mut self, now: Instant) {
        for (stream_id, interval) in self.timers.drain_due(now) {
            self.timeout_at(&stream_id, interval, now);
        }
    }

    /// A retry timer fired: resend the head update with a doubled interval,
    /// unless the ack arrived in the meantime (pending empty or deadline
    /// refreshed), the manager is paused, or the stream is gone or failed.
    fn timeout_at(&mut self, stream_id: &S, interval: Duration, now: Instant) {
        if self.paused {
            return;
        }
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return;
        };
        if stream.next().is_none() || stream.failed() {
            return;
        }

        if stream.timeout.is_some_and(|deadline| deadline <= now) {
            warn!(stream = %stream_id, "resending status update");
            let interval = self.retry.backoff(interval);
            self.forward_head_at(stream_id, interval, now);
        }
    }

    fn recover_stream(
        &mut self,
        stream_id: &S,
        strict: bool,
        now: Instant,
    ) -> ManagerResult<Option<RecoveredStream<U>>> {
        debug!(stream = %stream_id, "recovering status update stream");

        let path = (self.path_for)(stream_id);
        let recovered = UpdateStream::recover(stream_id.clone(), path, strict).map_err(|source| {
            ManagerError::Recover {
                stream: stream_id.to_string(),
                source,
            }
        })?;
        let Some((stream, state)) = recovered else {
            return Ok(None);
        };

        if stream.terminated() {
            // The stream already saw its terminal acknowledgement; report
            // the replayed state but do not resurrect it.
            return Ok(Some(state));
        }

        if let Some(framework_id) = stream.framework_id().cloned() {
            self.framework_streams
                .entry(framework_id)
                .or_default()
                .insert(stream_id.clone());
        }
        let has_next = stream.next().is_some();
        self.streams.insert(stream_id.clone(), stream);

        if !self.paused && has_next {
            let interval = self.retry.initial;
            self.forward_head_at(stream_id, interval, now);
        }

        Ok(Some(state))
    }

    fn cleanup_stream(&mut self, stream_id: &S) {
        debug!(stream = %stream_id, "cleaning up status update stream");

        let Some(stream) = self.streams.remove(stream_id) else {
            debug_assert!(false, "cannot find the status update stream");
            return;
        };

        if let Some(framework_id) = stream.framework_id()
            && let Some(framework_streams) = self.framework_streams.get_mut(framework_id)
        {
            framework_streams.remove(stream_id);
            if framework_streams.is_empty() {
                self.framework_streams.remove(framework_id);
            }
        }
    }

    /// Forwards the head of the stream's queue and arms its retry timer.
    fn forward_head_at(&mut self, stream_id: &S, interval: Duration, now: Instant) {
        debug_assert!(!self.paused);

        let deadline = now + interval;
        let head = {
            let Some(stream) = self.streams.get_mut(stream_id) else {
                return;
            };
            let Some(head) = stream.next().cloned() else {
                return;
            };
            stream.timeout = Some(deadline);
            head
        };

        debug!(stream = %stream_id, "forwarding status update");
        (self.forward)(&head);
        self.timers.arm(stream_id.clone(), deadline, interval);
    }
}
