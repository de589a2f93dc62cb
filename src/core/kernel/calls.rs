use crate::core::errors::SessionError;
use crate::core::types::{CallId, CallOutcome, Epoch};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, trace};

/// An in-flight call awaiting its single resolution.
#[derive(Debug)]
struct PendingCall {
    method: String,
    submitted_at: Instant,
    deadline: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

#[derive(Debug)]
struct Inner {
    epoch: Epoch,
    next_id: CallId,
    pending: HashMap<CallId, PendingCall>,
}

/// Correlates outgoing calls with their eventual responses.
///
/// Every registered call is resolved exactly once: by its response, by its own
/// deadline, or by `expire_all` when the connection epoch ends. Removal from the
/// pending map under the lock is the single assignment; any later resolution for
/// the same ID finds nothing and is a no-op.
///
/// Correlation IDs increase monotonically for the lifetime of the registry and
/// are never reused, so a response from a dead epoch cannot match a live call.
#[derive(Debug)]
pub struct CallRegistry {
    inner: Mutex<Inner>,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                epoch: 0,
                next_id: 1,
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection epoch.
    pub fn epoch(&self) -> Epoch {
        self.lock().epoch
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Register a call for `epoch` that must resolve by `deadline`.
    ///
    /// Fails with a connection-loss error if `epoch` already ended, so a call
    /// can never be attached to a connection that is gone.
    pub fn register(
        self: &Arc<Self>,
        epoch: Epoch,
        method: &str,
        timeout: Duration,
    ) -> Result<CallWaiter, SessionError> {
        let submitted_at = Instant::now();
        let deadline = submitted_at + timeout;
        let (slot, rx) = oneshot::channel();

        let id = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return Err(SessionError::connection_lost(format!(
                    "connection epoch {} ended before the call was registered",
                    epoch
                )));
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.pending.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    submitted_at,
                    deadline,
                    slot,
                },
            );
            id
        };

        trace!(id, epoch, method, "Registered call");
        Ok(CallWaiter {
            id,
            method: method.to_string(),
            timeout,
            deadline,
            rx,
            registry: Arc::clone(self),
            finished: false,
            _permit: None,
        })
    }

    /// Complete a pending call.
    ///
    /// Returns `false` when the ID is unknown or already resolved (a duplicate
    /// or late response); that is logged and otherwise ignored.
    pub fn resolve(&self, id: CallId, outcome: CallOutcome) -> bool {
        let Some(call) = self.lock().pending.remove(&id) else {
            debug!(id, "Discarding resolution for unknown or already resolved call");
            return false;
        };

        trace!(
            id,
            method = %call.method,
            elapsed_ms = call.submitted_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            past_deadline = Instant::now() > call.deadline,
            "Resolved call"
        );
        // The waiter may have been dropped by a caller that gave up.
        let _ = call.slot.send(outcome);
        true
    }

    /// Resolve every outstanding call with `reason`. Returns how many were failed.
    pub fn expire_all(&self, reason: &SessionError) -> usize {
        let drained: Vec<(CallId, PendingCall)> = self.lock().pending.drain().collect();
        let count = drained.len();
        for (id, call) in drained {
            trace!(id, method = %call.method, "Expiring call: {}", reason);
            let _ = call.slot.send(Err(reason.clone()));
        }
        if count > 0 {
            debug!(count, "Expired pending calls: {}", reason);
        }
        count
    }

    /// End the current epoch: fail everything still pending and start a new one.
    pub fn begin_epoch(&self, reason: &SessionError) -> Epoch {
        let epoch = {
            let mut inner = self.lock();
            inner.epoch += 1;
            inner.epoch
        };
        self.expire_all(reason);
        epoch
    }

    fn forget(&self, id: CallId) {
        if self.lock().pending.remove(&id).is_some() {
            trace!(id, "Caller abandoned call; a late response will be discarded");
        }
    }
}

/// The caller's half of a registered call.
///
/// Dropping the waiter before it resolves abandons the call: the request stays on
/// the wire but its eventual response is discarded.
#[derive(Debug)]
pub struct CallWaiter {
    id: CallId,
    method: String,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<CallOutcome>,
    registry: Arc<CallRegistry>,
    finished: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl CallWaiter {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Hold an admission-control permit until the call resolves.
    pub(crate) fn with_permit(mut self, permit: Option<OwnedSemaphorePermit>) -> Self {
        self._permit = permit;
        self
    }

    /// Wait for the call's single resolution.
    ///
    /// The server response and the deadline timer race into the same slot; the
    /// first writer wins and the other becomes a no-op.
    pub async fn wait(mut self) -> CallOutcome {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SessionError::connection_lost("call slot dropped")),
            Err(_) => {
                let timed_out = SessionError::TimeoutError {
                    method: self.method.clone(),
                    after: self.timeout,
                };
                self.registry.resolve(self.id, Err(timed_out.clone()));
                // Whichever completion won is now in the slot.
                (&mut self.rx).await.unwrap_or(Err(timed_out))
            }
        };
        self.finished = true;
        outcome
    }
}

impl Drop for CallWaiter {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.forget(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ConnectionFailure;
    use serde_json::json;

    fn registry() -> Arc<CallRegistry> {
        Arc::new(CallRegistry::new())
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let registry = registry();
        let waiter = registry
            .register(0, "public/test", Duration::from_secs(5))
            .unwrap();
        let id = waiter.id();

        assert!(registry.resolve(id, Ok(json!("first"))));
        assert!(!registry.resolve(id, Ok(json!("second"))));
        assert_eq!(waiter.wait().await.unwrap(), json!("first"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let registry = registry();
        let a = registry.register(0, "a", Duration::from_secs(1)).unwrap();
        let b = registry.register(0, "b", Duration::from_secs(1)).unwrap();
        registry.begin_epoch(&SessionError::connection_lost("test"));
        let c = registry.register(1, "c", Duration::from_secs(1)).unwrap();
        assert!(a.id() < b.id());
        assert!(b.id() < c.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_resolves_with_timeout_and_late_response_is_noop() {
        let registry = registry();
        let waiter = registry
            .register(0, "private/buy", Duration::from_millis(50))
            .unwrap();
        let id = waiter.id();

        let started = Instant::now();
        let outcome = waiter.wait().await;
        assert!(matches!(outcome, Err(SessionError::TimeoutError { .. })));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(60));

        assert!(!registry.resolve(id, Ok(json!("late"))));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_begin_epoch_expires_pending_and_rejects_stale_registration() {
        let registry = registry();
        let waiters: Vec<_> = (0..3)
            .map(|_| registry.register(0, "x", Duration::from_secs(5)).unwrap())
            .collect();

        let epoch = registry.begin_epoch(&SessionError::connection_lost("reset"));
        assert_eq!(epoch, 1);

        for waiter in waiters {
            assert!(matches!(
                waiter.wait().await,
                Err(SessionError::ConnectionError(ConnectionFailure::Lost(_)))
            ));
        }

        assert!(registry.register(0, "x", Duration::from_secs(1)).is_err());
        assert!(registry.register(1, "x", Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_forgotten() {
        let registry = registry();
        let waiter = registry.register(0, "x", Duration::from_secs(5)).unwrap();
        let id = waiter.id();
        drop(waiter);

        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.resolve(id, Ok(json!(1))));
    }
}
