//! Correlation of forwarded calls with their replies.
//!
//! Every call sent over a live link carries a fresh tid. The first terminal
//! event for a tid (response, error, or deadline) resolves the call and
//! removes the entry; later events for the same tid are ignored. Progress
//! events never resolve.

use lattice_core::envelope::RemoteOutcome;
use lattice_core::ErrorPayload;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

pub type CallOutcome = Result<RemoteOutcome, ErrorPayload>;
pub type ProgressFn = Arc<dyn Fn(Value) + Send + Sync>;

struct PendingCall {
    resolver: oneshot::Sender<CallOutcome>,
    progress: Option<ProgressFn>,
}

#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    /// Register a call and get the receiver its outcome will arrive on.
    pub fn register(&self, tid: &str, progress: Option<ProgressFn>) -> oneshot::Receiver<CallOutcome> {
        let (resolver, receiver) = oneshot::channel();
        self.calls
            .lock()
            .expect("pending lock")
            .insert(tid.to_string(), PendingCall { resolver, progress });
        receiver
    }

    /// Resolve a call, at most once. Unknown or already-resolved tids are
    /// dropped silently.
    pub fn resolve(&self, tid: &str, outcome: CallOutcome) {
        let call = self.calls.lock().expect("pending lock").remove(tid);
        match call {
            Some(call) => {
                let _ = call.resolver.send(outcome);
            }
            None => debug!(tid = %tid, "reply for unknown or settled call dropped"),
        }
    }

    /// Deliver progress without settling the call.
    pub fn progress(&self, tid: &str, body: Value) {
        let calls = self.calls.lock().expect("pending lock");
        if let Some(call) = calls.get(tid) {
            if let Some(progress) = &call.progress {
                progress(body);
            }
        }
    }

    /// Abandon a call that exceeded its deadline; later replies are ignored.
    pub fn abandon(&self, tid: &str) {
        self.calls.lock().expect("pending lock").remove(tid);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.calls.lock().expect("pending lock").len()
    }
}
