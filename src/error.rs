use thiserror::Error;

use crate::actor::HandleError;
use crate::checkpoint::CheckpointError;
use crate::manager::ManagerError;
use crate::stream::StreamError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the module errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Handle(#[from] HandleError),
}
