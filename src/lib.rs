#![forbid(unsafe_code)]

pub mod actor;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod manager;
pub mod retry;
pub mod stream;
pub mod telemetry;
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;
pub mod update;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main types at the crate root for convenience.
pub use crate::actor::{HandleError, ManagerHandle};
pub use crate::checkpoint::{CheckpointError, CheckpointRecord, RecordKind};
pub use crate::config::ManagerConfig;
pub use crate::manager::{
    ForwardFn, ManagerError, PathFn, RecoveredState, StatusUpdateManager, StreamState,
};
pub use crate::retry::RetryPolicy;
pub use crate::stream::{RecoveredStream, StreamError, UpdateStream};
pub use crate::update::StatusUpdate;
