use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid operation kind: {0}")]
    InvalidOperationKind(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
