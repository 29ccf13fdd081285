//! Approval queue and callback port
//!
//! Token issuance requires a user decision. The authorization server never
//! talks to a UI directly; it emits approval requests through the
//! [`ApprovalPort`] and suspends the requester on a pending entry. Any
//! frontend (native dialog, web page, CLI prompt) resolves the entry by
//! calling approve or deny. Requests are served strictly FIFO with at most
//! one prompt visible at a time.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How long a shown prompt may wait for a decision before counting as denial.
pub const APPROVAL_TIMEOUT_SECS: u64 = 30;

/// Queued requests older than this are dropped without being shown.
pub const APPROVAL_STALE_SECS: i64 = 60;

/// An approval request as presented to the frontend.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub request_id: u64,
    pub application_name: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Localized display names, index-aligned with `scopes`.
    pub display_scopes: Vec<String>,
    pub enqueued_at_ms: i64,
}

/// Frontend port. `show` is called once per request, only when the request
/// reaches the head of the queue.
pub trait ApprovalPort: Send + Sync {
    fn show(&self, request: &ApprovalRequest);
}

struct PendingApproval {
    request: ApprovalRequest,
    responder: oneshot::Sender<bool>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<PendingApproval>,
    active: Option<PendingApproval>,
}

/// FIFO approval queue. Guarded by its own lock, separate from the token
/// store lock, so a slow UI interaction never blocks unrelated token
/// operations.
pub struct ApprovalQueue {
    state: Mutex<QueueState>,
    port: Mutex<Option<Arc<dyn ApprovalPort>>>,
}

impl ApprovalQueue {
    pub fn new() -> Self {
        ApprovalQueue {
            state: Mutex::new(QueueState::default()),
            port: Mutex::new(None),
        }
    }

    pub fn set_port(&self, port: Arc<dyn ApprovalPort>) {
        *self.port.lock() = Some(port);
    }

    /// Enqueue a request and receive the channel its decision arrives on.
    /// If nothing is active the prompt is shown immediately.
    pub fn enqueue(&self, request: ApprovalRequest, now_ms: i64) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingApproval {
            request,
            responder: tx,
        };
        let to_show = {
            let mut state = self.state.lock();
            if state.active.is_none() {
                let shown = pending.request.clone();
                state.active = Some(pending);
                Some(shown)
            } else {
                debug!(
                    target: "auth",
                    request_id = pending.request.request_id,
                    queue_len = state.waiting.len(),
                    "approval request queued behind active prompt"
                );
                state.waiting.push_back(pending);
                None
            }
        };
        if let Some(request) = to_show {
            self.show(&request);
        }
        // Drop stale entries opportunistically on every mutation.
        self.drop_stale(now_ms);
        rx
    }

    /// Resolve the request with the given id. Returns false when no such
    /// request is pending (already resolved, timed out, or never queued).
    pub fn resolve(&self, request_id: u64, approved: bool, now_ms: i64) -> bool {
        let (resolved, next) = {
            let mut state = self.state.lock();
            let matched = match &state.active {
                Some(active) if active.request.request_id == request_id => {
                    state.active.take()
                }
                _ => {
                    let pos = state
                        .waiting
                        .iter()
                        .position(|p| p.request.request_id == request_id);
                    pos.and_then(|i| state.waiting.remove(i))
                }
            };
            let resolved = match matched {
                Some(pending) => {
                    // Receiver may have timed out and gone away; that is a
                    // denial already, nothing more to do.
                    let _ = pending.responder.send(approved);
                    true
                }
                None => false,
            };
            let next = if state.active.is_none() {
                Self::pop_fresh(&mut state, now_ms)
            } else {
                None
            };
            (resolved, next)
        };
        if let Some(request) = next {
            self.show(&request);
        }
        resolved
    }

    /// Abandon the active prompt after a requester-side timeout and advance
    /// the queue.
    pub fn abandon(&self, request_id: u64, now_ms: i64) {
        let next = {
            let mut state = self.state.lock();
            if matches!(&state.active, Some(a) if a.request.request_id == request_id) {
                state.active = None;
            } else {
                state
                    .waiting
                    .retain(|p| p.request.request_id != request_id);
            }
            if state.active.is_none() {
                Self::pop_fresh(&mut state, now_ms)
            } else {
                None
            }
        };
        if let Some(request) = next {
            self.show(&request);
        }
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        state.waiting.len() + usize::from(state.active.is_some())
    }

    fn drop_stale(&self, now_ms: i64) {
        let mut state = self.state.lock();
        let horizon = now_ms - APPROVAL_STALE_SECS * 1000;
        let before = state.waiting.len();
        state.waiting.retain(|p| p.request.enqueued_at_ms >= horizon);
        let dropped = before - state.waiting.len();
        if dropped > 0 {
            warn!(target: "auth", dropped, "dropped stale approval requests");
        }
    }

    /// Take the next non-stale entry, making it active.
    fn pop_fresh(state: &mut QueueState, now_ms: i64) -> Option<ApprovalRequest> {
        let horizon = now_ms - APPROVAL_STALE_SECS * 1000;
        while let Some(pending) = state.waiting.pop_front() {
            if pending.request.enqueued_at_ms < horizon {
                warn!(
                    target: "auth",
                    request_id = pending.request.request_id,
                    "approval request went stale before being shown"
                );
                continue;
            }
            let request = pending.request.clone();
            state.active = Some(pending);
            return Some(request);
        }
        None
    }

    fn show(&self, request: &ApprovalRequest) {
        let port = self.port.lock().clone();
        match port {
            Some(port) => port.show(request),
            None => warn!(
                target: "auth",
                request_id = request.request_id,
                "no approval port registered, request will time out"
            ),
        }
    }
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingPort {
        shown: Mutex<Vec<u64>>,
    }

    impl ApprovalPort for RecordingPort {
        fn show(&self, request: &ApprovalRequest) {
            self.shown.lock().push(request.request_id);
        }
    }

    fn request(id: u64, now_ms: i64) -> ApprovalRequest {
        ApprovalRequest {
            request_id: id,
            application_name: "Sample".to_string(),
            client_id: "c1".to_string(),
            scopes: vec!["battery".to_string()],
            display_scopes: vec!["Battery".to_string()],
            enqueued_at_ms: now_ms,
        }
    }

    #[tokio::test]
    async fn test_single_prompt_at_a_time() {
        let queue = ApprovalQueue::new();
        let port = Arc::new(RecordingPort::default());
        queue.set_port(port.clone());

        let rx1 = queue.enqueue(request(1, 0), 0);
        let rx2 = queue.enqueue(request(2, 0), 0);
        assert_eq!(*port.shown.lock(), vec![1]);

        assert!(queue.resolve(1, true, 0));
        assert!(rx1.await.unwrap());
        // The second prompt only appears after the first resolves.
        assert_eq!(*port.shown.lock(), vec![1, 2]);

        assert!(queue.resolve(2, false, 0));
        assert!(!rx2.await.unwrap());
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_unknown_request() {
        let queue = ApprovalQueue::new();
        assert!(!queue.resolve(99, true, 0));
    }

    #[tokio::test]
    async fn test_stale_entries_skipped() {
        let queue = ApprovalQueue::new();
        let port = Arc::new(RecordingPort::default());
        queue.set_port(port.clone());

        let _rx1 = queue.enqueue(request(1, 0), 0);
        let rx2 = queue.enqueue(request(2, 0), 0);
        let rx3 = queue.enqueue(request(3, 1_000_000), 1_000_000);

        // Resolving the active prompt long after request 2 was enqueued
        // skips it and shows request 3 directly.
        queue.resolve(1, true, 1_000_000);
        assert_eq!(*port.shown.lock(), vec![1, 3]);

        // The skipped requester observes a dropped channel (denial).
        assert!(rx2.await.is_err());

        queue.resolve(3, true, 1_000_000);
        assert!(rx3.await.unwrap());
    }

    #[tokio::test]
    async fn test_abandon_advances_queue() {
        let queue = ApprovalQueue::new();
        let port = Arc::new(RecordingPort::default());
        queue.set_port(port.clone());

        let _rx1 = queue.enqueue(request(1, 0), 0);
        let _rx2 = queue.enqueue(request(2, 0), 0);

        queue.abandon(1, 0);
        assert_eq!(*port.shown.lock(), vec![1, 2]);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_without_port_still_pending() {
        let queue = ApprovalQueue::new();
        let _rx = queue.enqueue(request(1, 0), 0);
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.resolve(1, false, 0));
    }
}
