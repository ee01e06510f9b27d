//! In-flight request bookkeeping.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RpcError;
use crate::types::RequestId;

pub type PendingResult = Result<Value, RpcError>;

type PendingRequest = oneshot::Sender<PendingResult>;

/// Outstanding requests keyed by id.
///
/// Every entry is removed exactly once: by its response, by its caller's
/// timeout, or by [`RequestTable::reject_all`] on transport failure. Because
/// removal and completion happen under one lock, an id can never be completed
/// twice.
#[derive(Default)]
pub struct RequestTable {
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiver its completion will arrive on.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<PendingResult> {
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.lock().insert(id.clone(), tx);
        if previous.is_some() {
            tracing::warn!(%id, "Request id reused while still pending");
        }
        rx
    }

    /// Complete `id`. Returns false if it is unknown (late or duplicate reply).
    pub fn complete(&self, id: &RequestId, result: PendingResult) -> bool {
        let sender = self.pending.lock().remove(id);
        match sender {
            Some(sender) => {
                // The caller may have given up between removal and send; that is fine.
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Forget `id` without completing it (caller-side timeout).
    pub fn remove(&self, id: &RequestId) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Fail every outstanding request. Returns how many were rejected.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(RpcError::ConnectionClosed(reason.to_string())));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
