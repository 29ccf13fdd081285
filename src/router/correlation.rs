//! Pending-request arena
//!
//! Every outbound plugin request gets a process-unique correlation id and a
//! waitable handle stored in the arena. The asynchronous response path
//! completes the handle; the waiting caller is otherwise released by a
//! synthesized timeout error. Either way the entry leaves the arena, and an
//! id is never reused while its handle is pending.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{error_response, ErrorCode};

/// Payload field carrying the correlation id across the plugin boundary.
pub const FIELD_REQUEST_CODE: &str = "requestCode";

/// A waitable slot for one in-flight request.
pub struct PendingHandle {
    pub correlation_id: u64,
    rx: oneshot::Receiver<Map<String, Value>>,
}

/// Arena of pending handles indexed by correlation id.
pub struct CorrelationArena {
    pending: Mutex<HashMap<u64, oneshot::Sender<Map<String, Value>>>>,
    next_id: AtomicU64,
}

impl CorrelationArena {
    pub fn new() -> Self {
        CorrelationArena {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh id and park a handle for it.
    pub fn insert(&self) -> PendingHandle {
        let correlation_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);
        PendingHandle { correlation_id, rx }
    }

    /// Complete the handle for the given id with a response. Returns false
    /// when the id is unknown (already completed, evicted, or timed out).
    pub fn complete(&self, correlation_id: u64, response: Map<String, Value>) -> bool {
        let sender = self.pending.lock().remove(&correlation_id);
        match sender {
            Some(tx) => {
                // A racing timeout may have dropped the receiver; the entry
                // is gone either way.
                let _ = tx.send(response);
                true
            }
            None => {
                debug!(
                    target: "gateway",
                    correlation_id,
                    "late response for unknown correlation id"
                );
                false
            }
        }
    }

    /// Drop a pending entry without completing it.
    pub fn evict(&self, correlation_id: u64) -> bool {
        self.pending.lock().remove(&correlation_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Block on the handle until its response arrives or the deadline
    /// passes, synthesizing a timeout error in the latter case. The entry
    /// is removed from the arena in every outcome.
    pub async fn wait(&self, handle: PendingHandle, timeout: Duration) -> Map<String, Value> {
        let correlation_id = handle.correlation_id;
        match tokio::time::timeout(timeout, handle.rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                // Sender dropped through evict; treat as timeout.
                error_response(ErrorCode::Timeout)
            }
            Err(_) => {
                self.evict(correlation_id);
                debug!(target: "gateway", correlation_id, "request timed out");
                error_response(ErrorCode::Timeout)
            }
        }
    }
}

impl Default for CorrelationArena {
    fn default() -> Self {
        Self::new()
    }
}
