//! Mailbox wrapper running the manager on its own thread.
//!
//! All stream state is owned by one loop that processes commands strictly in
//! arrival order; timer deadlines are woven in by bounding the channel wait
//! with the soonest retry deadline. The [`ManagerHandle`] methods post a
//! command and block on its reply.

use std::fmt;
use std::hash::Hash;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::manager::{ForwardFn, ManagerError, PathFn, RecoveredState, StatusUpdateManager};
use crate::update::StatusUpdate;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("status update manager terminated")]
    Terminated,
}

enum Command<S, U: StatusUpdate> {
    Update {
        update: U,
        stream_id: S,
        checkpoint: bool,
        reply: Sender<Result<(), ManagerError>>,
    },
    Acknowledgement {
        stream_id: S,
        uuid: Uuid,
        reply: Sender<Result<bool, ManagerError>>,
    },
    Recover {
        stream_ids: Vec<S>,
        strict: bool,
        reply: Sender<Result<RecoveredState<S, U>, ManagerError>>,
    },
    Cleanup {
        framework_id: U::FrameworkId,
    },
    Pause,
    Resume,
    Shutdown,
}

/// Owning handle to a spawned status update manager. Dropping the handle
/// shuts the manager down and joins its thread.
pub struct ManagerHandle<S, U: StatusUpdate> {
    tx: Sender<Command<S, U>>,
    join: Option<JoinHandle<()>>,
}

impl<S, U> ManagerHandle<S, U>
where
    S: Clone + Eq + Hash + fmt::Display + Send + 'static,
    U: StatusUpdate + Send + 'static,
    U::FrameworkId: Send + 'static,
{
    pub fn spawn(config: ManagerConfig, forward: ForwardFn<U>, path_for: PathFn<S>) -> Self {
        let (tx, rx) = unbounded();
        let join = thread::spawn(move || {
            run(StatusUpdateManager::new(&config, forward, path_for), rx);
        });
        Self {
            tx,
            join: Some(join),
        }
    }

    pub fn update(&self, update: U, stream_id: S, checkpoint: bool) -> Result<(), HandleError> {
        let (reply, response) = bounded(1);
        self.tx
            .send(Command::Update {
                update,
                stream_id,
                checkpoint,
                reply,
            })
            .map_err(|_| HandleError::Terminated)?;
        response
            .recv()
            .map_err(|_| HandleError::Terminated)?
            .map_err(HandleError::Manager)
    }

    /// Returns `true` iff the stream is still alive after the ack.
    pub fn acknowledgement(&self, stream_id: S, uuid: Uuid) -> Result<bool, HandleError> {
        let (reply, response) = bounded(1);
        self.tx
            .send(Command::Acknowledgement {
                stream_id,
                uuid,
                reply,
            })
            .map_err(|_| HandleError::Terminated)?;
        response
            .recv()
            .map_err(|_| HandleError::Terminated)?
            .map_err(HandleError::Manager)
    }

    pub fn recover(
        &self,
        stream_ids: Vec<S>,
        strict: bool,
    ) -> Result<RecoveredState<S, U>, HandleError> {
        let (reply, response) = bounded(1);
        self.tx
            .send(Command::Recover {
                stream_ids,
                strict,
                reply,
            })
            .map_err(|_| HandleError::Terminated)?;
        response
            .recv()
            .map_err(|_| HandleError::Terminated)?
            .map_err(HandleError::Manager)
    }

    pub fn cleanup(&self, framework_id: U::FrameworkId) {
        let _ = self.tx.send(Command::Cleanup { framework_id });
    }

    pub fn pause(&self) {
        let _ = self.tx.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(Command::Resume);
    }
}

impl<S, U: StatusUpdate> Drop for ManagerHandle<S, U> {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run<S, U>(mut manager: StatusUpdateManager<S, U>, rx: Receiver<Command<S, U>>)
where
    S: Clone + Eq + Hash + fmt::Display,
    U: StatusUpdate,
{
    loop {
        let command = match manager.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        manager.run_timers();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Update {
                update,
                stream_id,
                checkpoint,
                reply,
            } => {
                let _ = reply.send(manager.update(&update, &stream_id, checkpoint));
            }
            Command::Acknowledgement {
                stream_id,
                uuid,
                reply,
            } => {
                let _ = reply.send(manager.acknowledgement(&stream_id, uuid));
            }
            Command::Recover {
                stream_ids,
                strict,
                reply,
            } => {
                let _ = reply.send(manager.recover(stream_ids, strict));
            }
            Command::Cleanup { framework_id } => manager.cleanup(&framework_id),
            Command::Pause => manager.pause(),
            Command::Resume => manager.resume(),
            Command::Shutdown => break,
        }
    }
    debug!("status update manager loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::{ForwardProbe, TestUpdate, path_in};
    use tempfile::TempDir;

    fn handle(temp: &TempDir) -> (ManagerHandle<String, TestUpdate>, ForwardProbe) {
        let probe = ForwardProbe::new();
        let handle = ManagerHandle::spawn(
            ManagerConfig::default(),
            probe.sink(),
            path_in(temp.path()),
        );
        (handle, probe)
    }

    #[test]
    fn commands_run_in_arrival_order() {
        let temp = TempDir::new().unwrap();
        let (handle, probe) = handle(&temp);
        let first = TestUpdate::new(1);
        let second = TestUpdate::new(2);

        handle.update(first.clone(), "s1".to_string(), false).unwrap();
        handle.update(second.clone(), "s1".to_string(), false).unwrap();
        assert!(handle.acknowledgement("s1".to_string(), first.uuid()).unwrap());
        assert!(handle.acknowledgement("s1".to_string(), second.uuid()).unwrap());

        assert_eq!(probe.forwarded(), vec![first, second]);
    }

    #[test]
    fn errors_cross_the_channel() {
        let temp = TempDir::new().unwrap();
        let (handle, _probe) = handle(&temp);

        let err = handle
            .acknowledgement("nope".to_string(), Uuid::from_bytes([1u8; 16]))
            .unwrap_err();
        assert!(matches!(
            err,
            HandleError::Manager(ManagerError::UnknownStream { .. })
        ));
    }

    #[test]
    fn drop_joins_the_manager_thread() {
        let temp = TempDir::new().unwrap();
        let (handle, _probe) = handle(&temp);
        handle.update(TestUpdate::new(1), "s1".to_string(), false).unwrap();
        drop(handle);
    }
}
