//! virtool-sync - Client Data Synchronization
//!
//! The data layer of a laboratory data-management client. It mirrors the
//! server's collections (jobs, samples, analyses, viruses, history, users,
//! groups, ...) in memory, keeps them consistent over one WebSocket, persists
//! retained collections locally and exposes a query and subscription API.
//!
//! # Module Structure
//!
//! - **`shared`** - Types with no I/O
//!   - Wire protocol, documents, typed event emitter
//!   - Error types and configuration
//!
//! - **`client`** - The synchronization core
//!   - Transaction registry and outbound queue
//!   - Local document stores and query language
//!   - Settings, user session and router
//!   - Dispatcher, local database, transport and session actor
//!
//! # Usage
//!
//! ```rust,no_run
//! use virtool_sync::client::session;
//! use virtool_sync::shared::AppConfig;
//!
//! # async fn example() -> Result<(), virtool_sync::shared::SyncError> {
//! let (handle, _task) = session::start(AppConfig::load(None)?).await?;
//! handle.wait_synced().await?;
//! let samples = handle.call(|d| d.store("samples").map(|s| s.len())).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! The dispatcher and everything it owns is single-owner state driven by one
//! tokio task. Other tasks reach it through `SessionHandle`, which queues
//! closures to run on that task.

/// Shared types and data structures
pub mod shared;

/// Synchronization core
pub mod client;
