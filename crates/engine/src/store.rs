use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use mutq_core::{OpId, Operation, OperationPayload, SeqClock};
use mutq_remote::RemoteEndpoint;

use crate::config::QueueConfig;
use crate::coordinator::{FailureReason, SaveCoordinator, SaveResult};
use crate::error::EngineError;
use crate::log::OperationLog;
use crate::resolver::{resolve, Resolution, Resolved};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Idle,
    Saving,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Saving => "saving",
            Self::Error => "error",
        }
    }
}

/// Detail of the most recent failed save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveError {
    /// First operation that did not apply, when the endpoint named one.
    pub failed_op: Option<OpId>,
    pub reason: FailureReason,
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failed_op {
            Some(op_id) => write!(f, "operation {op_id} failed: {}", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Read-only view of the queue handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub status: QueueStatus,
    pub last_error: Option<SaveError>,
    pub operations: Vec<Operation>,
    /// Bumped on every state transition.
    pub revision: u64,
}

impl QueueSnapshot {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get(&self, op_id: OpId) -> Option<&Operation> {
        self.operations.iter().find(|op| op.op_id() == op_id)
    }

    pub fn op_ids(&self) -> Vec<OpId> {
        self.operations.iter().map(Operation::op_id).collect()
    }

    pub fn summaries(&self) -> Vec<String> {
        self.operations.iter().map(Operation::summary).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// The operation now carrying the change; `None` when it cancelled out.
    pub op_id: Option<OpId>,
    pub outcome: Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued { op_id: Option<OpId>, outcome: Resolution },
    Discarded { op_id: OpId },
    Cleared { discarded: usize },
    SaveStarted { operations: usize },
    SaveFinished { result: SaveResult },
    /// A save came back after the queue was discarded; its result was not applied.
    SaveDropped { result: SaveResult },
}

struct State {
    log: OperationLog,
    clock: SeqClock,
    status: QueueStatus,
    last_error: Option<SaveError>,
    /// Bumped by `discard_all` so an in-flight save can tell it was abandoned.
    generation: u64,
    /// A request is outstanding at the endpoint, even if its generation was discarded.
    in_flight: bool,
    revision: u64,
}

struct Shared<E> {
    state: Mutex<State>,
    coordinator: SaveCoordinator<E>,
    config: QueueConfig,
    snapshots: watch::Sender<Arc<QueueSnapshot>>,
    events: broadcast::Sender<QueueEvent>,
}

impl<E> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, State> {
        // No method leaves `State` half-updated across a panic point.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a transition and push the new snapshot to subscribers.
    fn publish(&self, state: &mut State) {
        state.revision += 1;
        self.snapshots.send_replace(Arc::new(QueueSnapshot {
            status: state.status,
            last_error: state.last_error.clone(),
            operations: state.log.to_ordered_list(),
            revision: state.revision,
        }));
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

/// The editing session's pending-changes queue.
///
/// Cloning yields another handle to the same queue. All commands except
/// `save` complete synchronously; the state lock is never held across an
/// await.
pub struct QueueStore<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for QueueStore<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: RemoteEndpoint> QueueStore<E> {
    pub fn new(endpoint: E) -> Self {
        Self::with_config(endpoint, QueueConfig::default())
    }

    pub fn with_config(endpoint: E, config: QueueConfig) -> Self {
        let initial = Arc::new(QueueSnapshot {
            status: QueueStatus::Idle,
            last_error: None,
            operations: Vec::new(),
            revision: 0,
        });
        let (snapshots, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    log: OperationLog::new(),
                    clock: SeqClock::new(),
                    status: QueueStatus::Idle,
                    last_error: None,
                    generation: 0,
                    in_flight: false,
                    revision: 0,
                }),
                coordinator: SaveCoordinator::new(endpoint),
                config,
                snapshots,
                events,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn endpoint(&self) -> &E {
        self.shared.coordinator.endpoint()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Stamp `payload` as a new operation and resolve it into the log.
    ///
    /// Rejected with `SaveAlreadyInProgress` while a save is in flight: the
    /// submitted operations must not be rewritten under the endpoint.
    pub fn enqueue(&self, payload: OperationPayload) -> Result<Enqueued, EngineError> {
        let mut state = self.shared.lock();
        if state.status == QueueStatus::Saving {
            return Err(EngineError::SaveAlreadyInProgress);
        }

        let seq = state.clock.tick();
        let op = Operation::new(seq, payload);
        let kind = op.kind();
        let Resolved { log, outcome, op_id } = resolve(&state.log, op)?;
        state.log = log;
        debug!(%kind, ?op_id, ?outcome, pending = state.log.len(), "enqueued");

        self.shared.publish(&mut state);
        self.shared.emit(QueueEvent::Enqueued {
            op_id,
            outcome: outcome.clone(),
        });
        Ok(Enqueued { op_id, outcome })
    }

    /// Drop one pending operation.
    pub fn discard(&self, op_id: OpId) -> Result<(), EngineError> {
        let mut state = self.shared.lock();
        if state.status == QueueStatus::Saving {
            return Err(EngineError::SaveAlreadyInProgress);
        }
        if state.log.get(op_id).is_none() {
            return Err(EngineError::OperationNotFound(op_id.to_string()));
        }

        state.log = state.log.without(op_id);
        let failed_here = state
            .last_error
            .as_ref()
            .is_some_and(|error| error.failed_op == Some(op_id));
        if state.log.is_empty() || failed_here {
            state.status = QueueStatus::Idle;
            state.last_error = None;
        }
        debug!(%op_id, pending = state.log.len(), "discarded operation");

        self.shared.publish(&mut state);
        self.shared.emit(QueueEvent::Discarded { op_id });
        Ok(())
    }

    /// Empty the queue and return to `Idle`. A save still in flight keeps
    /// running remotely but its result will be ignored; no new save can start
    /// until it settles.
    pub fn discard_all(&self) {
        let mut state = self.shared.lock();
        let clean = state.log.is_empty()
            && state.status == QueueStatus::Idle
            && state.last_error.is_none();
        if clean {
            return;
        }

        let discarded = state.log.len();
        if state.status == QueueStatus::Saving {
            info!(discarded, "discarding queue while a save is in flight");
        }
        state.log = OperationLog::new();
        state.status = QueueStatus::Idle;
        state.last_error = None;
        state.generation += 1;

        self.shared.publish(&mut state);
        self.shared.emit(QueueEvent::Cleared { discarded });
    }

    /// Save with the configured timeout.
    pub async fn save(&self) -> Result<SaveResult, EngineError> {
        self.save_with_timeout(self.shared.config.save_timeout()).await
    }

    /// Submit every pending operation as one batch and reconcile the result.
    ///
    /// Remote failures are not errors here: they come back in the
    /// [`SaveResult`] and are reflected in the queue's status.
    pub async fn save_with_timeout(&self, timeout: Duration) -> Result<SaveResult, EngineError> {
        let (ops, generation) = {
            let mut state = self.shared.lock();
            if state.status == QueueStatus::Saving || state.in_flight {
                return Err(EngineError::SaveAlreadyInProgress);
            }
            if state.log.is_empty() {
                return Err(EngineError::EmptyQueue);
            }
            state.status = QueueStatus::Saving;
            state.in_flight = true;
            let ops = state.log.to_ordered_list();
            self.shared.publish(&mut state);
            (ops, state.generation)
        };
        info!(operations = ops.len(), generation, "save started");
        self.shared.emit(QueueEvent::SaveStarted {
            operations: ops.len(),
        });

        let mut in_flight = InFlight {
            shared: &self.shared,
            generation,
            settled: false,
        };
        let result = self.shared.coordinator.submit(ops, timeout).await;
        in_flight.settled = true;

        let mut state = self.shared.lock();
        state.in_flight = false;
        if state.generation != generation {
            warn!(
                applied = result.applied_count(),
                "save finished after the queue was discarded; ignoring result"
            );
            self.shared.emit(QueueEvent::SaveDropped {
                result: result.clone(),
            });
            return Ok(result);
        }

        match &result {
            SaveResult::FullSuccess { applied } => {
                state.log = state.log.retain_unapplied(applied);
                state.status = QueueStatus::Idle;
                state.last_error = None;
            }
            SaveResult::PartialSuccess { applied, failed } => {
                state.log = state.log.retain_unapplied(applied);
                state.status = QueueStatus::Error;
                state.last_error = Some(SaveError {
                    failed_op: Some(failed.op_id),
                    reason: FailureReason::RemoteRejected {
                        reason: failed.reason.clone(),
                        op: Some(failed.op_id),
                    },
                });
            }
            SaveResult::TotalFailure(reason) => {
                state.status = QueueStatus::Error;
                state.last_error = Some(SaveError {
                    failed_op: reason.failed_op(),
                    reason: reason.clone(),
                });
            }
        }
        info!(
            status = state.status.as_str(),
            applied = result.applied_count(),
            pending = state.log.len(),
            "save finished"
        );

        self.shared.publish(&mut state);
        self.shared.emit(QueueEvent::SaveFinished {
            result: result.clone(),
        });
        Ok(result)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn snapshot(&self) -> Arc<QueueSnapshot> {
        self.shared.snapshots.borrow().clone()
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.lock().status
    }

    /// A receiver that sees every snapshot the moment it is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<QueueSnapshot>> {
        self.shared.snapshots.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }
}

/// Puts the queue into `Error` if a save future is dropped mid-flight.
struct InFlight<'a, E> {
    shared: &'a Shared<E>,
    generation: u64,
    settled: bool,
}

impl<E> Drop for InFlight<'_, E> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.shared.lock();
        state.in_flight = false;
        if state.generation == self.generation && state.status == QueueStatus::Saving {
            warn!("save abandoned before the endpoint replied");
            state.status = QueueStatus::Error;
            state.last_error = Some(SaveError {
                failed_op: None,
                reason: FailureReason::Cancelled,
            });
            self.shared.publish(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use mutq_core::{ColumnDef, ColumnId, TableId};
    use mutq_remote::{RemoteError, SaveRequest, SaveResponse};
    use proptest::prelude::*;

    /// Applies everything unless told to stop after `fail_at` operations.
    #[derive(Default)]
    struct Endpoint {
        fail_at: StdMutex<Option<usize>>,
        requests: StdMutex<Vec<SaveRequest>>,
    }

    #[async_trait]
    impl RemoteEndpoint for Endpoint {
        async fn execute(&self, request: SaveRequest) -> Result<SaveResponse, RemoteError> {
            let fail_at = *self.fail_at.lock().unwrap();
            let response = match fail_at {
                Some(n) if n < request.len() => SaveResponse::Partial {
                    applied: n,
                    failed_op: request.operations[n].op_id(),
                    reason: "boom".into(),
                },
                _ => SaveResponse::Applied {
                    count: request.len(),
                },
            };
            self.requests.lock().unwrap().push(request);
            Ok(response)
        }
    }

    fn add_column(table: TableId) -> OperationPayload {
        OperationPayload::AddColumn {
            table,
            column: ColumnId::new(),
            definition: ColumnDef::new("c", "text"),
        }
    }

    #[test]
    fn enqueue_publishes_synchronously() -> Result<(), EngineError> {
        let store = QueueStore::new(Endpoint::default());
        let mut snapshots = store.subscribe();
        let mut events = store.events();

        let enqueued = store.enqueue(add_column(TableId::new()))?;

        assert!(snapshots.has_changed().unwrap());
        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.op_ids(), vec![enqueued.op_id.unwrap()]);
        assert_eq!(
            events.try_recv().unwrap(),
            QueueEvent::Enqueued {
                op_id: enqueued.op_id,
                outcome: Resolution::Appended
            }
        );
        Ok(())
    }

    #[test]
    fn discard_removes_one_and_resets_when_empty() -> Result<(), EngineError> {
        let store = QueueStore::new(Endpoint::default());
        let t = TableId::new();
        let a = store.enqueue(add_column(t))?.op_id.unwrap();
        let b = store.enqueue(add_column(t))?.op_id.unwrap();

        store.discard(a)?;
        assert_eq!(store.snapshot().op_ids(), vec![b]);
        assert!(matches!(store.discard(a), Err(EngineError::OperationNotFound(_))));

        store.discard(b)?;
        assert!(store.snapshot().is_empty());
        assert_eq!(store.status(), QueueStatus::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn discarding_the_failed_operation_clears_the_error() -> Result<(), EngineError> {
        let endpoint = Endpoint::default();
        *endpoint.fail_at.lock().unwrap() = Some(1);
        let store = QueueStore::new(endpoint);
        let t = TableId::new();
        let ids: Vec<OpId> = (0..3)
            .map(|_| store.enqueue(add_column(t)).map(|e| e.op_id.unwrap()))
            .collect::<Result<_, _>>()?;
        store.save().await?;
        assert_eq!(store.status(), QueueStatus::Error);

        // Discarding some other operation leaves the report alone.
        store.discard(ids[2])?;
        let snapshot = store.snapshot();
        assert_eq!(snapshot.status, QueueStatus::Error);
        assert_eq!(snapshot.last_error.as_ref().and_then(|e| e.failed_op), Some(ids[1]));

        store.enqueue(add_column(t))?;
        store.discard(ids[1])?;
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.status, QueueStatus::Idle);
        assert_eq!(snapshot.last_error, None);
        Ok(())
    }

    #[tokio::test]
    async fn save_on_empty_queue_is_rejected() {
        let store = QueueStore::new(Endpoint::default());
        assert!(matches!(store.save().await, Err(EngineError::EmptyQueue)));
        assert!(store.endpoint().requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_success_clears_the_queue() -> Result<(), EngineError> {
        let store = QueueStore::new(Endpoint::default());
        store.enqueue(add_column(TableId::new()))?;
        store.enqueue(add_column(TableId::new()))?;

        let result = store.save().await?;
        assert!(result.is_full_success());
        let snapshot = store.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.status, QueueStatus::Idle);
        assert_eq!(snapshot.last_error, None);
        Ok(())
    }

    #[tokio::test]
    async fn partial_success_keeps_the_suffix() -> Result<(), EngineError> {
        let endpoint = Endpoint::default();
        *endpoint.fail_at.lock().unwrap() = Some(2);
        let store = QueueStore::new(endpoint);
        let ids: Vec<OpId> = (0..4)
            .map(|_| store.enqueue(add_column(TableId::new())).map(|e| e.op_id.unwrap()))
            .collect::<Result<_, _>>()?;

        store.save().await?;
        let snapshot = store.snapshot();
        assert_eq!(snapshot.op_ids(), ids[2..].to_vec());
        assert_eq!(snapshot.status, QueueStatus::Error);
        assert_eq!(
            snapshot.last_error,
            Some(SaveError {
                failed_op: Some(ids[2]),
                reason: FailureReason::RemoteRejected {
                    reason: "boom".into(),
                    op: Some(ids[2]),
                },
            })
        );

        // Retrying sends only what is left.
        *store.endpoint().fail_at.lock().unwrap() = None;
        store.save().await?;
        let requests = store.endpoint().requests.lock().unwrap();
        assert_eq!(requests[1].op_ids(), ids[2..].to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn dropping_a_save_future_leaves_an_error() -> Result<(), EngineError> {
        struct Hang;

        #[async_trait]
        impl RemoteEndpoint for Hang {
            async fn execute(&self, _request: SaveRequest) -> Result<SaveResponse, RemoteError> {
                std::future::pending().await
            }
        }

        let store = QueueStore::new(Hang);
        store.enqueue(add_column(TableId::new()))?;
        {
            let save = store.save();
            tokio::pin!(save);
            let poll = poll_once(save.as_mut()).await;
            assert!(poll.is_none());
            assert_eq!(store.status(), QueueStatus::Saving);
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.status, QueueStatus::Error);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.last_error.as_ref().map(|e| &e.reason),
            Some(&FailureReason::Cancelled)
        );
        Ok(())
    }

    async fn poll_once<F: std::future::Future + Unpin>(fut: F) -> Option<F::Output> {
        let mut fut = fut;
        std::future::poll_fn(|cx| {
            std::task::Poll::Ready(match std::pin::Pin::new(&mut fut).poll(cx) {
                std::task::Poll::Ready(out) => Some(out),
                std::task::Poll::Pending => None,
            })
        })
        .await
    }

    proptest! {
        #[test]
        fn discard_all_is_idempotent(adds in 0usize..12) {
            let store = QueueStore::new(Endpoint::default());
            let table = TableId::new();
            for _ in 0..adds {
                store.enqueue(add_column(table)).map_err(|e| TestCaseError::fail(e.to_string()))?;
            }

            store.discard_all();
            let once = store.snapshot();
            store.discard_all();
            let twice = store.snapshot();

            prop_assert_eq!(&once, &twice);
            prop_assert!(twice.is_empty());
            prop_assert_eq!(twice.status, QueueStatus::Idle);
            prop_assert_eq!(&twice.last_error, &None);
        }
    }
}
