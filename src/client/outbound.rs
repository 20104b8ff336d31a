//! Outbound request path
//!
//! The single way anything in the client talks to the server. A request is
//! registered with the transaction registry, stamped with its `tid`,
//! serialized and queued as a text frame. The session task drains the queue
//! into the socket after every step, so sending never blocks.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::client::dispatcher::Continuation;
use crate::client::transaction::{Outcome, Responder, Transaction, TransactionRegistry};
use crate::shared::error::TransactionError;
use crate::shared::protocol::{OutboundRequest, Tid};

/// What to do when a reply arrives
pub(crate) enum Reply {
    /// A caller holding a [`Transaction`]
    Caller(Transaction),
    /// Dispatcher-internal continuation (sync handshake, login)
    Internal(Continuation),
}

impl Responder for Reply {
    fn respond(self, outcome: Outcome) {
        match self {
            Reply::Caller(transaction) => transaction.respond(outcome),
            // Internal replies are routed by the dispatcher before they reach here.
            Reply::Internal(continuation) => continuation.abandon(outcome),
        }
    }
}

/// Registry plus queue of serialized frames awaiting the socket
pub struct Outbound {
    registry: TransactionRegistry<Reply>,
    frames: VecDeque<String>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("registry", &self.registry)
            .field("queued_frames", &self.frames.len())
            .finish()
    }
}

impl Outbound {
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: TransactionRegistry::new(timeout),
            frames: VecDeque::new(),
        }
    }

    pub fn with_seed(timeout: Duration, seed: u64) -> Self {
        Self {
            registry: TransactionRegistry::with_seed(timeout, seed),
            frames: VecDeque::new(),
        }
    }

    /// Send `request`; the returned handle accepts `success`/`failure` callbacks
    pub fn send(&mut self, request: OutboundRequest) -> Transaction {
        let transaction = Transaction::new();
        if let Some(tid) = self.enqueue(request, Reply::Caller(transaction.clone())) {
            transaction.set_tid(tid);
        }
        transaction
    }

    pub(crate) fn send_internal(
        &mut self,
        request: OutboundRequest,
        continuation: Continuation,
    ) -> Option<Tid> {
        self.enqueue(request, Reply::Internal(continuation))
    }

    fn enqueue(&mut self, mut request: OutboundRequest, reply: Reply) -> Option<Tid> {
        let tid = self.registry.register(reply, Instant::now());
        request.tid = Some(tid);
        match serde_json::to_string(&request) {
            Ok(frame) => {
                tracing::debug!(
                    tid,
                    collection = %request.collection_name,
                    method = %request.method_name,
                    "Queued request"
                );
                self.frames.push_back(frame);
                Some(tid)
            }
            Err(e) => {
                tracing::error!(tid, "Failed to serialize request: {}", e);
                if let Some(reply) = self.registry.take(tid) {
                    reply.respond(Err(TransactionError::Failed(
                        serde_json::json!({ "reason": "serialization" }),
                    )));
                }
                None
            }
        }
    }

    /// Frames written since the last call, in send order
    pub fn take_frames(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    /// Number of requests awaiting a reply
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    pub fn is_pending(&self, tid: Tid) -> bool {
        self.registry.is_pending(tid)
    }

    pub(crate) fn take(&mut self, tid: Tid) -> Option<Reply> {
        self.registry.take(tid)
    }

    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(Tid, Reply)> {
        self.registry.expire(now)
    }

    pub(crate) fn drain_pending(&mut self) -> Vec<(Tid, Reply)> {
        self.registry.drain()
    }

    /// Drop frames that never reached a socket
    pub(crate) fn discard_frames(&mut self) -> usize {
        let count = self.frames.len();
        self.frames.clear();
        count
    }
}
