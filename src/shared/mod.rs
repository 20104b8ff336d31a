//! Shared Module
//!
//! Types used by every part of the client: the wire protocol, documents,
//! the event emitter, errors and configuration. Nothing here performs I/O.

/// Document type and identifier/version access
pub mod document;

/// Typed publish/subscribe
pub mod event;

/// Shared error types
pub mod error;

/// JSON wire protocol
pub mod protocol;

/// Application configuration
pub mod config;

/// Re-export commonly used types for convenience
pub use config::{AppConfig, AppConfigBuilder, ConfigError};
pub use document::Document;
pub use error::{SyncError, TransactionError};
pub use event::{Emitter, ListenerId};
pub use protocol::{Inbound, OutboundRequest, Tid};
