//! Pending-call bookkeeping for the request/reply client.
//!
//! Removing an entry from the map is the single point where a call's
//! outcome is decided: whoever removes it (reply listener, timeout,
//! cancellation, connection loss) is the only one allowed to resolve it.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// What a pending call resolves to
pub type CallOutcome = Result<Value>;

/// Client-side record of a request that still waits for its reply
#[derive(Debug)]
pub struct PendingCall {
    pub created_at: Instant,
    pub deadline: Instant,
    timeout: Duration,
    outcome_slot: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    fn resolve(self, outcome: CallOutcome) {
        // The waiter may already be gone; the outcome is then irrelevant
        let _ = self.outcome_slot.send(outcome);
    }
}

/// Map of in-flight calls keyed by correlation id
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call under a fresh correlation id
    pub fn register(&self, timeout: Duration) -> (String, Instant, oneshot::Receiver<CallOutcome>) {
        let (outcome_slot, outcome) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = created_at + timeout;

        let mut calls = self.calls.lock();
        let mut correlation_id = Uuid::new_v4().to_string();
        while calls.contains_key(&correlation_id) {
            correlation_id = Uuid::new_v4().to_string();
        }
        calls.insert(
            correlation_id.clone(),
            PendingCall {
                created_at,
                deadline,
                timeout,
                outcome_slot,
            },
        );
        (correlation_id, deadline, outcome)
    }

    /// Deliver `outcome` to the matching call; `false` if none is pending
    pub fn resolve(&self, correlation_id: &str, outcome: CallOutcome) -> bool {
        let call = self.calls.lock().remove(correlation_id);
        match call {
            Some(call) => {
                call.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop a call without notifying its waiter
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.calls.lock().remove(correlation_id).is_some()
    }

    /// Cancel a call on behalf of its owner; the waiter sees `Cancelled`
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.resolve(correlation_id, Err(RelayError::Cancelled))
    }

    /// Fail every pending call; returns how many were failed
    pub fn fail_all(&self, error: impl Fn() -> RelayError) -> usize {
        let drained: Vec<PendingCall> = self.calls.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            call.resolve(Err(error()));
        }
        count
    }

    /// Resolve every call whose deadline is at or before `now` with `Timeout`
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let expired: Vec<PendingCall> = {
            let mut calls = self.calls.lock();
            let ids: Vec<String> = calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| calls.remove(id)).collect()
        };

        let count = expired.len();
        for call in expired {
            let timeout_ms = call.timeout.as_millis() as u64;
            call.resolve(Err(RelayError::Timeout { timeout_ms }));
        }
        count
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.calls.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
