//! The pending-changes queue: an ordered, conflict-aware log of schema and
//! data operations, flushed to a [`RemoteEndpoint`](mutq_remote::RemoteEndpoint)
//! as one batch with partial-failure recovery.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod log;
pub mod resolver;
pub mod store;

pub use config::QueueConfig;
pub use coordinator::{FailedOperation, FailureReason, SaveCoordinator, SaveResult};
pub use error::EngineError;
pub use log::OperationLog;
pub use resolver::{resolve, Resolution, Resolved};
pub use store::{Enqueued, QueueEvent, QueueSnapshot, QueueStatus, QueueStore, SaveError};
