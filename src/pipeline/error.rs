use thiserror::Error;

use crate::acquisition::StreamError;
use crate::storage::PersistenceError;

/// Terminal errors reported by `await_completion`
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Result processor already started")]
    AlreadyStarted,

    #[error("Result processor was never started")]
    NotStarted,

    #[error("Result processor worker panicked")]
    WorkerPanicked,

    #[error("Failed to spawn result processor worker: {0}")]
    Spawn(std::io::Error),
}
