use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use mutq_core::{OpId, Operation};
use mutq_remote::{RemoteEndpoint, RemoteError, SaveRequest, SaveResponse};

/// Why nothing was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Timeout,
    ConnectionLost(String),
    /// `op` is the first operation the endpoint refused, when it named one.
    RemoteRejected { reason: String, op: Option<OpId> },
    /// The caller stopped waiting before the endpoint answered.
    Cancelled,
}

impl FailureReason {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::RemoteRejected {
            reason: reason.into(),
            op: None,
        }
    }

    pub fn failed_op(&self) -> Option<OpId> {
        match self {
            Self::RemoteRejected { op, .. } => *op,
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for the remote endpoint"),
            Self::ConnectionLost(detail) => write!(f, "connection lost: {detail}"),
            Self::RemoteRejected { reason, .. } => write!(f, "rejected: {reason}"),
            Self::Cancelled => write!(f, "save abandoned before the endpoint replied"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub op_id: OpId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveResult {
    FullSuccess {
        applied: Vec<OpId>,
    },
    /// `applied` is the prefix that made it; `failed` is the operation right
    /// after it.
    PartialSuccess {
        applied: Vec<OpId>,
        failed: FailedOperation,
    },
    TotalFailure(FailureReason),
}

impl SaveResult {
    pub fn applied(&self) -> &[OpId] {
        match self {
            Self::FullSuccess { applied } | Self::PartialSuccess { applied, .. } => applied,
            Self::TotalFailure(_) => &[],
        }
    }

    pub fn applied_count(&self) -> usize {
        self.applied().len()
    }

    pub fn is_full_success(&self) -> bool {
        matches!(self, Self::FullSuccess { .. })
    }
}

/// Sends the pending operations as one batch and classifies the outcome.
pub struct SaveCoordinator<E> {
    endpoint: E,
}

impl<E: RemoteEndpoint> SaveCoordinator<E> {
    pub fn new(endpoint: E) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Submit `ops` in order, waiting at most `timeout` for the reply. Remote
    /// and transport errors come back as [`SaveResult::TotalFailure`].
    #[tracing::instrument(level = "debug", skip(self, ops), fields(ops = ops.len()))]
    pub async fn submit(&self, ops: Vec<Operation>, timeout: Duration) -> SaveResult {
        let request = match SaveRequest::new(ops) {
            Ok(request) => request,
            Err(e) => return SaveResult::TotalFailure(FailureReason::rejected(e.to_string())),
        };
        let batch_id = request.batch_id;
        let ids = request.op_ids();
        info!(batch = %batch_id, ops = ids.len(), "submitting batch");

        let response = match tokio::time::timeout(timeout, self.endpoint.execute(request)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(batch = %batch_id, ?timeout, "save timed out");
                return SaveResult::TotalFailure(FailureReason::Timeout);
            }
        };

        let result = classify(&ids, response);
        match &result {
            SaveResult::FullSuccess { applied } => {
                info!(batch = %batch_id, applied = applied.len(), "batch applied");
            }
            SaveResult::PartialSuccess { applied, failed } => {
                warn!(batch = %batch_id, applied = applied.len(), failed = %failed.op_id, reason = %failed.reason, "batch partially applied");
            }
            SaveResult::TotalFailure(reason) => {
                warn!(batch = %batch_id, %reason, "batch failed");
            }
        }
        result
    }
}

fn classify(ids: &[OpId], response: Result<SaveResponse, RemoteError>) -> SaveResult {
    let response = match response {
        Ok(response) => response,
        Err(RemoteError::ConnectionLost(detail)) => {
            return SaveResult::TotalFailure(FailureReason::ConnectionLost(detail));
        }
        Err(e) => return SaveResult::TotalFailure(FailureReason::rejected(e.to_string())),
    };

    match response {
        SaveResponse::Applied { count } if count >= ids.len() => {
            if count > ids.len() {
                warn!(claimed = count, submitted = ids.len(), "endpoint over-reported applied operations");
            }
            SaveResult::FullSuccess {
                applied: ids.to_vec(),
            }
        }
        SaveResponse::Applied { count } => prefix_result(
            ids,
            count,
            format!("endpoint applied {count} of {} operations", ids.len()),
            None,
        ),
        SaveResponse::Partial {
            applied,
            failed_op,
            reason,
        } => prefix_result(ids, applied, reason, Some(failed_op)),
    }
}

fn prefix_result(ids: &[OpId], applied: usize, reason: String, reported: Option<OpId>) -> SaveResult {
    // A failure report always leaves at least the failed operation pending.
    let last = ids.len().saturating_sub(1);
    let applied = if applied > last {
        warn!(claimed = applied, submitted = ids.len(), "endpoint over-reported applied operations");
        last
    } else {
        applied
    };

    let Some(&failed_id) = ids.get(applied) else {
        return SaveResult::TotalFailure(FailureReason::rejected(reason));
    };
    if applied == 0 {
        // Nothing committed; an all-or-nothing endpoint may still name the culprit.
        let op = reported.filter(|op| ids.contains(op));
        if reported.is_some() && op.is_none() {
            warn!(?reported, "endpoint named an operation outside the batch");
        }
        return SaveResult::TotalFailure(FailureReason::RemoteRejected { reason, op });
    }
    if let Some(reported) = reported
        && reported != failed_id
    {
        warn!(%reported, expected = %failed_id, "endpoint named a different failed operation");
    }
    SaveResult::PartialSuccess {
        applied: ids[..applied].to_vec(),
        failed: FailedOperation {
            op_id: failed_id,
            reason,
        },
    }
}
