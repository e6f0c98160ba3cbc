//! Pending tool-approval table
//!
//! One global table keyed by tool-use ID. Every entry is resolved exactly
//! once: by a UI response, by the per-request timer (auto-deny), by a
//! vendor-side cancellation, by session close, or by global shutdown. Every
//! removal path clears the timer.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Message used when the timer fires
pub const TIMEOUT_MESSAGE: &str = "Permission request timed out";

/// Default deny message when the UI supplies none
pub const DEFAULT_DENY_MESSAGE: &str = "Permission denied by user";

/// Shared, rewritable session identifier.
///
/// Permission entries are created while a session may still be running under
/// its pending ID; the entry captures this handle instead of a snapshot so
/// that cancellation matches the real ID after promotion.
#[derive(Clone)]
pub struct SharedSessionId(Arc<RwLock<String>>);

impl SharedSessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(id.into())))
    }

    pub fn get(&self) -> String {
        self.0.read().expect("session id lock poisoned").clone()
    }

    pub fn set(&self, id: impl Into<String>) {
        *self.0.write().expect("session id lock poisoned") = id.into();
    }
}

/// The user's (or the system's) verdict on a tool use
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow { updated_permissions: Option<Value> },
    Deny { message: String },
}

/// Why a pending entry was rejected without a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionRejection {
    /// The vendor withdrew the request
    Aborted,
    /// The owning session was closed
    SessionClosed,
    /// The bridge is shutting down
    Shutdown,
}

/// Outcome delivered to the waiter
pub type PermissionOutcome = Result<PermissionDecision, PermissionRejection>;

struct PendingPermission {
    request_id: String,
    session_id: SharedSessionId,
    tx: oneshot::Sender<PermissionOutcome>,
    timer: Option<JoinHandle<()>>,
}

/// Pending tool-approval table (C3)
pub struct PermissionHandler {
    /// tool_use_id → pending entry
    pending: Mutex<HashMap<String, PendingPermission>>,
    /// vendor request_id → tool_use_id, for cancel routing
    by_request: Mutex<HashMap<String, String>>,
    timeout: Duration,
}

impl PermissionHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            by_request: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a pending approval and arm its timer. Returns the receiver
    /// the session's responder task awaits.
    ///
    /// A second registration under the same tool-use ID is a programmer
    /// error; the stale entry is rejected as aborted so its waiter cannot
    /// leak.
    pub fn register(
        self: &Arc<Self>,
        tool_use_id: &str,
        request_id: &str,
        session_id: SharedSessionId,
    ) -> oneshot::Receiver<PermissionOutcome> {
        let (tx, rx) = oneshot::channel();

        let timer = {
            let handler = Arc::clone(self);
            let tool_use_id = tool_use_id.to_string();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if handler.resolve(
                    &tool_use_id,
                    PermissionDecision::Deny {
                        message: TIMEOUT_MESSAGE.to_string(),
                    },
                ) {
                    tracing::warn!(tool_use_id = %tool_use_id, "Permission request timed out");
                }
            })
        };

        let entry = PendingPermission {
            request_id: request_id.to_string(),
            session_id,
            tx,
            timer: Some(timer),
        };

        let stale = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            let stale = pending.insert(tool_use_id.to_string(), entry);
            self.by_request
                .lock()
                .expect("request index lock poisoned")
                .insert(request_id.to_string(), tool_use_id.to_string());
            stale
        };

        if let Some(stale) = stale {
            tracing::error!(
                tool_use_id = tool_use_id,
                "Duplicate permission registration, rejecting stale entry"
            );
            finish(stale, Err(PermissionRejection::Aborted));
        }

        rx
    }

    /// Resolve a pending entry with a verdict. Returns false (and logs) when
    /// the ID is unknown; it never panics.
    pub fn resolve(&self, tool_use_id: &str, decision: PermissionDecision) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(tool_use_id);

        match entry {
            Some(entry) => {
                self.by_request
                    .lock()
                    .expect("request index lock poisoned")
                    .remove(&entry.request_id);
                finish(entry, Ok(decision));
                true
            }
            None => {
                tracing::error!(
                    tool_use_id = tool_use_id,
                    "Permission response for unknown tool use"
                );
                false
            }
        }
    }

    /// Reject the entry behind a vendor-side cancellation.
    pub fn abort_by_request(&self, request_id: &str) {
        let tool_use_id = self
            .by_request
            .lock()
            .expect("request index lock poisoned")
            .remove(request_id);

        if let Some(tool_use_id) = tool_use_id {
            if let Some(entry) = self
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&tool_use_id)
            {
                tracing::debug!(tool_use_id = %tool_use_id, "Permission request aborted by vendor");
                finish(entry, Err(PermissionRejection::Aborted));
            }
        }
    }

    /// Reject every pending entry owned by a session.
    pub fn cancel_for_session(&self, session_id: &str) {
        let entries = self.drain_matching(|entry| entry.session_id.get() == session_id);
        for entry in entries {
            finish(entry, Err(PermissionRejection::SessionClosed));
        }
    }

    /// Reject every pending entry. Used on global shutdown.
    pub fn cancel_all(&self) {
        let entries = self.drain_matching(|_| true);
        for entry in entries {
            finish(entry, Err(PermissionRejection::Shutdown));
        }
    }

    /// Number of outstanding approvals.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    fn drain_matching(
        &self,
        predicate: impl Fn(&PendingPermission) -> bool,
    ) -> Vec<PendingPermission> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let mut by_request = self.by_request.lock().expect("request index lock poisoned");

        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| id.clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| {
                pending.remove(&id).map(|entry| {
                    by_request.remove(&entry.request_id);
                    entry
                })
            })
            .collect()
    }
}

/// Deliver the outcome and clear the timer. The oneshot guarantees the
/// continuation cannot fire twice.
fn finish(mut entry: PendingPermission, outcome: PermissionOutcome) {
    let _ = entry.tx.send(outcome);
    if let Some(timer) = entry.timer.take() {
        timer.abort();
    }
}
