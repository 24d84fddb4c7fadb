use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("batch checksum mismatch")]
    ChecksumMismatch,

    #[error("batch already applied: {0}")]
    DuplicateBatch(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("unknown row: {0}")]
    UnknownRow(String),

    #[error("core error: {0}")]
    Core(#[from] mutq_core::CoreError),
}
