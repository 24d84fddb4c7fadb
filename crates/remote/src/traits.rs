use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mutq_core::{ids::*, operations::Operation};

use crate::error::RemoteError;

/// One transactional submission: the pending operations in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub batch_id: BatchId,
    pub operations: Vec<Operation>,
    pub checksum: [u8; 32],
}

impl SaveRequest {
    pub fn new(operations: Vec<Operation>) -> Result<Self, RemoteError> {
        let checksum = checksum_of(&operations)?;
        Ok(Self {
            batch_id: BatchId::new(),
            operations,
            checksum,
        })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn op_ids(&self) -> Vec<OpId> {
        self.operations.iter().map(Operation::op_id).collect()
    }

    /// Recompute the checksum over the carried operations.
    pub fn verify_checksum(&self) -> Result<(), RemoteError> {
        if checksum_of(&self.operations)? == self.checksum {
            Ok(())
        } else {
            Err(RemoteError::ChecksumMismatch)
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, RemoteError> {
        rmp_serde::to_vec(self).map_err(|e| RemoteError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, RemoteError> {
        rmp_serde::from_slice(bytes).map_err(|e| RemoteError::Serialization(e.to_string()))
    }
}

fn checksum_of(operations: &[Operation]) -> Result<[u8; 32], RemoteError> {
    let mut hasher = blake3::Hasher::new();
    for op in operations {
        hasher.update(&op.to_msgpack()?);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// What the remote side reports after running a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveResponse {
    /// Every operation was applied.
    Applied { count: usize },
    /// The first `applied` operations were applied; `failed_op` was not.
    Partial {
        applied: usize,
        failed_op: OpId,
        reason: String,
    },
}

/// The remote system that turns a batch of operations into schema and data
/// changes.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn execute(&self, request: SaveRequest) -> Result<SaveResponse, RemoteError>;
}

#[async_trait]
impl<E: RemoteEndpoint + ?Sized> RemoteEndpoint for Arc<E> {
    async fn execute(&self, request: SaveRequest) -> Result<SaveResponse, RemoteError> {
        (**self).execute(request).await
    }
}
