use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use mutq_remote::{RemoteEndpoint, RemoteError, SaveRequest, SaveResponse};

/// What the endpoint does with the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    ApplyAll,
    /// Apply the first `index` operations, then fail.
    FailAt { index: usize, reason: String },
    ConnectionLost(String),
    Rejected(String),
    /// Never answer.
    Hang,
}

/// An in-memory endpoint that answers from a queue of scripts and records
/// every request it sees. Once the scripts run out it applies everything.
pub struct ScriptedEndpoint {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<SaveRequest>>,
    arrived: watch::Sender<usize>,
    gate: watch::Sender<bool>,
}

impl Default for ScriptedEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            arrived: watch::channel(0).0,
            gate: watch::channel(true).0,
        }
    }

    pub fn push(&self, script: Script) -> &Self {
        lock(&self.scripts).push_back(script);
        self
    }

    /// Park every request after it is recorded until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Resolves once at least `n` requests have arrived.
    pub async fn wait_for_requests(&self, n: usize) {
        let mut arrived = self.arrived.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = arrived.wait_for(|count| *count >= n).await;
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<SaveRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl RemoteEndpoint for ScriptedEndpoint {
    async fn execute(&self, request: SaveRequest) -> Result<SaveResponse, RemoteError> {
        request.verify_checksum()?;
        let script = lock(&self.scripts).pop_front().unwrap_or(Script::ApplyAll);
        let ids = request.op_ids();
        lock(&self.requests).push(request);
        self.arrived.send_modify(|count| *count += 1);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        match script {
            Script::ApplyAll => Ok(SaveResponse::Applied { count: ids.len() }),
            Script::FailAt { index, reason } => match ids.get(index) {
                Some(&failed_op) => Ok(SaveResponse::Partial {
                    applied: index,
                    failed_op,
                    reason,
                }),
                None => Ok(SaveResponse::Applied { count: ids.len() }),
            },
            Script::ConnectionLost(detail) => Err(RemoteError::ConnectionLost(detail)),
            Script::Rejected(detail) => Err(RemoteError::Rejected(detail)),
            Script::Hang => std::future::pending().await,
        }
    }
}
