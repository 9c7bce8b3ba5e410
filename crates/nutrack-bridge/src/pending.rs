//! In-flight pipe requests keyed by correlation id.
//!
//! Each entry settles exactly once. A response, the deadline, a child exit
//! and the caller dropping its [`PendingCall`] all race to *remove* the
//! entry from the map. Whoever removes it owns the completion sender, and
//! everyone else becomes a no-op.
//!
//! # Thread Safety
//!
//! The table runs on a multi-threaded runtime, so check-and-remove is a
//! single `HashMap::remove` under a `std::sync::Mutex`. The lock is never
//! held across an `.await`.

use crate::error::{BridgeError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Opaque token pairing a pipe request with its response.
pub type CorrelationId = String;

/// Generate a fresh correlation id.
pub fn new_correlation_id() -> CorrelationId {
    uuid::Uuid::new_v4().simple().to_string()
}

struct PendingEntry {
    tx: oneshot::Sender<Result<Value>>,
    timeout: Duration,
}

/// Table of outstanding pipe requests.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<CorrelationId, PendingEntry>>,
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("outstanding", &self.len())
            .finish()
    }
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request and start its deadline.
    ///
    /// Fails with `DuplicateRequest` if `id` is already outstanding.
    pub fn register(self: &Arc<Self>, id: impl Into<CorrelationId>, timeout: Duration) -> Result<PendingCall> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();

        {
            let mut entries = self.lock();
            if entries.contains_key(&id) {
                return Err(BridgeError::DuplicateRequest { request_id: id });
            }
            entries.insert(id.clone(), PendingEntry { tx, timeout });
        }

        debug!("Registered pending request {} ({:?})", id, timeout);

        Ok(PendingCall {
            id,
            deadline: Instant::now() + timeout,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Settle a request with the backend's answer.
    ///
    /// Returns `false` (and does nothing else) when `id` is unknown, already
    /// settled, or timed out.
    pub fn resolve(&self, id: &str, payload: Result<Value>) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = entry.tx.send(payload);
                true
            }
            None => {
                warn!("Dropping response for unknown or expired request {}", id);
                false
            }
        }
    }

    /// Fail a request whose deadline passed, if it is still pending.
    pub fn on_timeout(&self, id: &str) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                debug!("Pending request {} timed out", id);
                let _ = entry.tx.send(Err(BridgeError::Timeout {
                    request_id: id.to_string(),
                    after: entry.timeout,
                }));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request, returning how many were failed.
    pub fn fail_all(&self, make_error: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(make_error()));
        }
        if count > 0 {
            debug!("Failed {} outstanding requests", count);
        }
        count
    }

    fn forget(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            debug!("Pending request {} abandoned by caller", id);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Waitable handle for one registered request.
///
/// Dropping it before it settles removes the entry, so a later response is
/// treated as unknown.
pub struct PendingCall {
    id: CorrelationId,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Value>>,
    table: Arc<PendingTable>,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response or the deadline, whichever settles the entry first.
    pub async fn wait(mut self) -> Result<Value> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(settled) => settled.unwrap_or_else(|_| Err(self.abandoned())),
            Err(_) => {
                // Either we remove the entry and send Timeout to ourselves, or
                // a resolver already removed it and its send is in flight.
                self.table.on_timeout(&self.id);
                (&mut self.rx)
                    .await
                    .unwrap_or_else(|_| Err(self.abandoned()))
            }
        }
    }

    fn abandoned(&self) -> BridgeError {
        BridgeError::TransportUnavailable {
            reason: format!("request {} was dropped without a response", self.id),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        // No-op once the entry has settled.
        self.table.forget(&self.id);
    }
}
