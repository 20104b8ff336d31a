//! Typed publish/subscribe
//!
//! Every stateful object in the client (stores, settings, user, router,
//! dispatcher) embeds one [`Emitter`], parameterized by its own event-name
//! enum `K` and payload type `P`. Listeners are plain closures invoked
//! synchronously, in registration order, on the thread that owns the emitter.
//!
//! ```rust
//! use virtool_sync::shared::event::Emitter;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! enum Kind { Change }
//!
//! let mut emitter: Emitter<Kind, u32> = Emitter::new();
//! let id = emitter.on(Kind::Change, |value| println!("changed to {value}"));
//! emitter.emit(Kind::Change, &7);
//! assert!(emitter.off(id));
//! ```
use std::fmt;

/// Handle returned by [`Emitter::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Handler<P> = Box<dyn FnMut(&P) + Send>;

struct Listener<K, P> {
    id: ListenerId,
    kind: K,
    handler: Handler<P>,
}

/// A listener registry for one stateful object
pub struct Emitter<K, P> {
    next_id: u64,
    listeners: Vec<Listener<K, P>>,
}

impl<K, P> Default for Emitter<K, P> {
    fn default() -> Self {
        Self {
            next_id: 1,
            listeners: Vec::new(),
        }
    }
}

impl<K: fmt::Debug, P> fmt::Debug for Emitter<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<K, P> Emitter<K, P>
where
    K: Copy + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to events of `kind`
    pub fn on<F>(&mut self, kind: K, handler: F) -> ListenerId
    where
        F: FnMut(&P) + Send + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push(Listener {
            id,
            kind,
            handler: Box::new(handler),
        });
        id
    }

    /// Unsubscribe a listener. Returns `false` if it was not registered.
    pub fn off(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.id != id);
        self.listeners.len() != before
    }

    /// Deliver `payload` to every listener registered for `kind`
    pub fn emit(&mut self, kind: K, payload: &P) {
        for listener in self.listeners.iter_mut().filter(|l| l.kind == kind) {
            (listener.handler)(payload);
        }
    }

    pub fn listener_count(&self, kind: K) -> usize {
        self.listeners.iter().filter(|l| l.kind == kind).count()
    }
}
