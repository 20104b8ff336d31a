//! Shared Error Types
//!
//! This module defines the error taxonomy of the synchronization layer.
//!
//! # Error Categories
//!
//! - `Transport` - the socket could not be opened or was lost
//! - `Protocol` - an inbound frame could not be understood
//! - `Transaction` - a correlated request failed, timed out or was orphaned
//! - `Query` - a store query could not be compiled
//! - `Storage` - the local SQLite mirror failed
//!
//! # Usage
//!
//! ```rust
//! use virtool_sync::shared::error::SyncError;
//!
//! let error = SyncError::protocol("missing operation field");
//! assert!(error.to_string().contains("missing operation field"));
//! ```
//!
//! # Thread Safety
//!
//! All error types are `Send + Sync` and can cross the session actor boundary.
use serde_json::Value;
use thiserror::Error;

/// Errors raised anywhere in the synchronization layer
#[derive(Debug, Error)]
pub enum SyncError {
    /// The WebSocket could not be opened or failed mid-session
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable error message
        message: String,
    },

    /// An inbound frame was malformed or violated the wire contract
    #[error("Protocol error: {message}")]
    Protocol {
        /// Human-readable error message
        message: String,
    },

    /// JSON serialization or deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message
        message: String,
    },

    /// A store query could not be compiled
    #[error("Query error: {message}")]
    Query {
        /// Human-readable error message
        message: String,
    },

    /// The local persistent mirror failed
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Configuration could not be loaded or was invalid
    #[error(transparent)]
    Config(#[from] crate::shared::config::ConfigError),

    /// A correlated request did not succeed
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// A request named a collection the dispatcher does not own
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// The session actor has shut down
    #[error("session is no longer running")]
    SessionClosed,
}

impl SyncError {
    /// Create a new transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(sqlx::Error::Io(err))
    }
}

/// Why a correlated request did not succeed
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransactionError {
    /// The server replied with `success: false`; carries the server payload
    #[error("request failed: {0}")]
    Failed(Value),

    /// No reply arrived before the request deadline
    #[error("request timed out")]
    Timeout,

    /// The connection closed while the request was pending
    #[error("connection closed before a reply arrived")]
    Disconnected,
}

impl TransactionError {
    /// Payload handed to `failure` callbacks.
    ///
    /// Server failures pass their payload through untouched; local conditions
    /// are reported as `{"reason": "timeout" | "disconnected"}`.
    pub fn payload(&self) -> Value {
        match self {
            Self::Failed(value) => value.clone(),
            Self::Timeout => serde_json::json!({ "reason": "timeout" }),
            Self::Disconnected => serde_json::json!({ "reason": "disconnected" }),
        }
    }
}
