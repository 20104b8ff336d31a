//! # Transaction Registry
//!
//! Correlates outbound requests with the server's later `transaction`
//! replies. Every request gets a random correlation id (`tid`) that is not
//! currently pending; the entry is removed as soon as it is resolved, when its
//! deadline passes, or when the connection closes.
//!
//! The registry is generic over what it stores so the dispatcher can keep
//! internal continuations next to caller-facing [`Transaction`] handles.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::{Duration, Instant};
//! use virtool_sync::client::transaction::TransactionRegistry;
//!
//! let mut registry = TransactionRegistry::new(Duration::from_secs(30));
//! let tid = registry.register_callbacks(
//!     |payload| println!("ok: {payload}"),
//!     |payload| println!("failed: {payload}"),
//!     Instant::now(),
//! );
//! assert!(registry.resolve(tid, true, serde_json::Value::Null));
//! assert!(!registry.resolve(tid, true, serde_json::Value::Null));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::shared::error::TransactionError;
use crate::shared::protocol::Tid;

/// Outcome delivered to a responder
pub type Outcome = Result<Value, TransactionError>;

/// Something that can be told how a request ended
pub trait Responder {
    fn respond(self, outcome: Outcome);
}

struct Pending<R> {
    responder: R,
    /// `None` when the timeout reaches past what `Instant` can represent
    deadline: Option<Instant>,
}

/// Pending requests keyed by correlation id
pub struct TransactionRegistry<R> {
    pending: HashMap<Tid, Pending<R>>,
    rng: StdRng,
    timeout: Duration,
}

impl<R> fmt::Debug for TransactionRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("pending", &self.pending.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<R> TransactionRegistry<R> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            rng: StdRng::from_entropy(),
            timeout,
        }
    }

    /// Deterministic id sequence, for tests and replay
    pub fn with_seed(timeout: Duration, seed: u64) -> Self {
        Self {
            pending: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            timeout,
        }
    }

    /// Store `responder` under a fresh id and return the id
    pub fn register(&mut self, responder: R, now: Instant) -> Tid {
        let tid = loop {
            let candidate = self.rng.gen_range(1..=Tid::MAX);
            if !self.pending.contains_key(&candidate) {
                break candidate;
            }
            tracing::trace!(tid = candidate, "Correlation id collision, regenerating");
        };
        self.pending.insert(
            tid,
            Pending {
                responder,
                deadline: now.checked_add(self.timeout),
            },
        );
        tid
    }

    /// Remove and return the entry for `tid`
    pub fn take(&mut self, tid: Tid) -> Option<R> {
        self.pending.remove(&tid).map(|p| p.responder)
    }

    pub fn is_pending(&self, tid: Tid) -> bool {
        self.pending.contains_key(&tid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evict every entry whose deadline is at or before `now`, oldest id first
    pub fn expire(&mut self, now: Instant) -> Vec<(Tid, R)> {
        let mut overdue: Vec<Tid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(tid, _)| *tid)
            .collect();
        overdue.sort_unstable();
        overdue
            .into_iter()
            .filter_map(|tid| self.take(tid).map(|r| (tid, r)))
            .collect()
    }

    /// Evict everything
    pub fn drain(&mut self) -> Vec<(Tid, R)> {
        let mut all: Vec<(Tid, R)> = self
            .pending
            .drain()
            .map(|(tid, p)| (tid, p.responder))
            .collect();
        all.sort_unstable_by_key(|(tid, _)| *tid);
        all
    }
}

impl<R: Responder> TransactionRegistry<R> {
    /// Resolve `tid` with the server's verdict.
    ///
    /// Returns `false` (after a warning) when no entry is pending under `tid`.
    pub fn resolve(&mut self, tid: Tid, succeeded: bool, payload: Value) -> bool {
        match self.take(tid) {
            Some(responder) => {
                let outcome = if succeeded {
                    Ok(payload)
                } else {
                    Err(TransactionError::Failed(payload))
                };
                responder.respond(outcome);
                true
            }
            None => {
                tracing::warn!(tid, "Reply for unknown or already resolved transaction");
                false
            }
        }
    }
}

impl TransactionRegistry<Transaction> {
    /// Register a success/failure callback pair directly
    pub fn register_callbacks<S, F>(&mut self, success: S, failure: F, now: Instant) -> Tid
    where
        S: FnOnce(Value) + Send + 'static,
        F: FnOnce(Value) + Send + 'static,
    {
        let transaction = Transaction::new().success(success).failure(failure);
        let tid = self.register(transaction.clone(), now);
        transaction.set_tid(tid);
        tid
    }
}

type Callback = Box<dyn FnOnce(Value) + Send>;

#[derive(Default)]
struct Slot {
    tid: Option<Tid>,
    outcome: Option<Outcome>,
    success: Option<Callback>,
    failure: Option<Callback>,
    success_registered: bool,
    failure_registered: bool,
}

/// Caller-side handle for one request.
///
/// `success` and `failure` may be attached in either order, before or after
/// the reply arrives, at most once each. A callback attached after the
/// matching outcome arrived fires immediately.
#[derive(Clone, Default)]
pub struct Transaction {
    slot: Arc<Mutex<Slot>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.lock();
        f.debug_struct("Transaction")
            .field("tid", &slot.tid)
            .field("resolved", &slot.outcome.is_some())
            .finish()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_tid(&self, tid: Tid) {
        self.lock().tid = Some(tid);
    }

    /// Correlation id, once the request has been sent
    pub fn tid(&self) -> Option<Tid> {
        self.lock().tid
    }

    /// Whether an outcome has been delivered to this handle
    pub fn is_resolved(&self) -> bool {
        let slot = self.lock();
        slot.outcome.is_some()
            || (slot.success_registered && slot.success.is_none())
            || (slot.failure_registered && slot.failure.is_none())
    }

    /// Attach the success callback
    pub fn success<F>(self, callback: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let ready = {
            let mut slot = self.lock();
            if slot.success_registered {
                tracing::warn!(tid = ?slot.tid, "success callback already registered, ignoring");
                return self.clone();
            }
            slot.success_registered = true;
            match slot.outcome.take() {
                Some(Ok(value)) => Some(value),
                other => {
                    slot.outcome = other;
                    slot.success = Some(Box::new(callback));
                    return self.clone();
                }
            }
        };
        if let Some(value) = ready {
            callback(value);
        }
        self
    }

    /// Attach the failure callback
    pub fn failure<F>(self, callback: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let ready = {
            let mut slot = self.lock();
            if slot.failure_registered {
                tracing::warn!(tid = ?slot.tid, "failure callback already registered, ignoring");
                return self.clone();
            }
            slot.failure_registered = true;
            match slot.outcome.take() {
                Some(Err(error)) => {
                    let payload = error.payload();
                    slot.outcome = Some(Err(error));
                    Some(payload)
                }
                other => {
                    slot.outcome = other;
                    slot.failure = Some(Box::new(callback));
                    return self.clone();
                }
            }
        };
        if let Some(payload) = ready {
            callback(payload);
        }
        self
    }

    /// Receive the outcome asynchronously instead of through callbacks.
    ///
    /// Uses both callback slots; if either was already taken the receiver
    /// reports a closed channel.
    pub fn outcome(self) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let already_taken = {
            let slot = self.lock();
            slot.success_registered || slot.failure_registered
        };
        if already_taken {
            tracing::warn!("outcome() called on a transaction that already has callbacks");
            return rx;
        }

        let shared = Arc::new(Mutex::new(Some(tx)));
        let on_failure = shared.clone();
        let failure_slot = self.slot.clone();
        self.success(move |value| {
            if let Some(tx) = take_sender(&shared) {
                let _ = tx.send(Ok(value));
            }
        })
        .failure(move |payload| {
            // Recover the typed error stashed by `respond` for local failures.
            let error = failure_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .outcome
                .take()
                .and_then(Result::err)
                .unwrap_or(TransactionError::Failed(payload));
            if let Some(tx) = take_sender(&on_failure) {
                let _ = tx.send(Err(error));
            }
        });
        rx
    }
}

fn take_sender(shared: &Mutex<Option<oneshot::Sender<Outcome>>>) -> Option<oneshot::Sender<Outcome>> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
}

impl Responder for Transaction {
    fn respond(self, outcome: Outcome) {
        let mut slot = self.lock();
        match outcome {
            Ok(value) => match slot.success.take() {
                Some(callback) => {
                    drop(slot);
                    callback(value);
                }
                None => slot.outcome = Some(Ok(value)),
            },
            Err(error) => match slot.failure.take() {
                Some(callback) => {
                    let payload = error.payload();
                    // Keep the typed error around for `outcome()` receivers.
                    slot.outcome = Some(Err(error));
                    drop(slot);
                    callback(payload);
                }
                None => slot.outcome = Some(Err(error)),
            },
        }
    }
}
