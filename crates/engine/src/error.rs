use mutq_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("invalid operation kind: {0}")]
    InvalidOperationKind(String),

    #[error("a save is already in progress")]
    SaveAlreadyInProgress,

    #[error("nothing to save")]
    EmptyQueue,

    #[error("operation rejected: {0}")]
    OperationRejected(String),

    #[error("operation not found: {0}")]
    OperationNotFound(String),
}
