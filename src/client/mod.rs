//! Client Module
//!
//! The synchronization core. Everything stateful lives behind the
//! [`dispatcher::Dispatcher`]; [`session`] runs it on a tokio task against a
//! real or in-memory transport.
//!
//! # Module Structure
//!
//! ```text
//! client/
//! ├── transaction.rs  - correlation ids, pending requests, caller handles
//! ├── outbound.rs     - request serialization and the send queue
//! ├── store/          - local document stores, query language, cursors
//! ├── settings.rs     - server settings mirror
//! ├── user.rs         - authenticated user and session cookie
//! ├── router.rs       - hash-fragment navigation state
//! ├── dispatcher.rs   - inbound routing and the sync handshake
//! ├── local_db/       - SQLite persistence of retained collections
//! ├── connection.rs   - transports and reconnect backoff
//! ├── session.rs      - the actor owning the dispatcher
//! └── main.rs         - sync-probe binary
//! ```

pub mod connection;
pub mod dispatcher;
pub mod local_db;
pub mod outbound;
pub mod router;
pub mod session;
pub mod settings;
pub mod store;
pub mod transaction;
pub mod user;

pub use dispatcher::{Dispatcher, DispatcherEvent, DispatcherEventKind, SyncProgress};
pub use session::{SessionHandle, spawn, start};
pub use store::{CollectionDefinition, Cursor, LocalStore, StoreEvent, StoreEventKind, StorePhase};
pub use transaction::Transaction;
