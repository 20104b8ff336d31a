//! # Local Database Module
//!
//! SQLite mirror of retained collections and the session cookie, so a
//! client can resume from its last known state and only ask the server for
//! what changed.
//!
//! The database file is `virtool-<server_id>.db` in the configured data
//! directory. The dispatcher never touches the database itself; it queues
//! [`StorageOp`]s which the session applies in order through
//! [`LocalDatabase::apply`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), virtool_sync::shared::SyncError> {
//! use virtool_sync::client::local_db::LocalDatabase;
//! use virtool_sync::shared::AppConfig;
//!
//! let config = AppConfig::builder().server_id("lab-1").build()?;
//! let db = LocalDatabase::open(&config).await?;
//! let jobs = db.load_collection("jobs").await?;
//! println!("{} jobs on disk", jobs.len());
//! # Ok(())
//! # }
//! ```

pub mod schema;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::client::user::SessionCookie;
use crate::shared::config::AppConfig;
use crate::shared::document::Document;
use crate::shared::error::SyncError;

/// Result type for local database operations
pub type Result<T> = std::result::Result<T, SyncError>;

const TOKEN_COOKIE: &str = "token";

/// A pending write produced by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum StorageOp {
    PutDocuments {
        collection: String,
        documents: Vec<Document>,
    },
    RemoveDocuments {
        collection: String,
        ids: Vec<String>,
    },
    /// Drop every persisted document
    ClearDocuments,
    SaveCookie(SessionCookie),
    ClearCookie,
}

/// Local database connection manager
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open or create the database for the configured server
    pub async fn open(config: &AppConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.database_path();

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        tracing::info!(path = %path.display(), "Opened local database");
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Private in-memory database; a single connection keeps one shared database
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(schema::SCHEMA).execute(&self.pool).await?;

        let current: (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;
        if !schema::needs_migration(current.0) {
            return Ok(());
        }

        for version in schema::pending_migrations(current.0) {
            tracing::debug!(version, "Applying local schema migration");
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply queued writes in order, inside one transaction
    pub async fn apply(&self, ops: &[StorageOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for op in ops {
            match op {
                StorageOp::PutDocuments {
                    collection,
                    documents,
                } => {
                    for document in documents {
                        let body = serde_json::to_string(&document.to_value())?;
                        sqlx::query(
                            "INSERT INTO documents (collection, id, version, body) VALUES (?, ?, ?, ?)
                             ON CONFLICT (collection, id) DO UPDATE
                             SET version = excluded.version, body = excluded.body",
                        )
                        .bind(collection)
                        .bind(document.id())
                        .bind(i64::try_from(document.version()).unwrap_or(i64::MAX))
                        .bind(body)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                StorageOp::RemoveDocuments { collection, ids } => {
                    for id in ids {
                        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                            .bind(collection)
                            .bind(id)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
                StorageOp::ClearDocuments => {
                    sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
                }
                StorageOp::SaveCookie(cookie) => {
                    sqlx::query(
                        "INSERT INTO cookies (name, value, expires_at) VALUES (?, ?, ?)
                         ON CONFLICT (name) DO UPDATE
                         SET value = excluded.value, expires_at = excluded.expires_at",
                    )
                    .bind(TOKEN_COOKIE)
                    .bind(&cookie.token)
                    .bind(cookie.expires_at.to_rfc3339())
                    .execute(&mut *tx)
                    .await?;
                }
                StorageOp::ClearCookie => {
                    sqlx::query("DELETE FROM cookies WHERE name = ?")
                        .bind(TOKEN_COOKIE)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        tracing::debug!(ops = ops.len(), "Applied storage operations");
        Ok(())
    }

    /// Every persisted document of `collection`, ordered by id.
    ///
    /// Rows whose body no longer parses are skipped with a warning.
    pub async fn load_collection(&self, collection: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT id, body FROM documents WHERE collection = ? ORDER BY id")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let body: String = row.try_get("body")?;
            match serde_json::from_str::<serde_json::Value>(&body)
                .map_err(SyncError::from)
                .and_then(Document::from_value)
            {
                Ok(document) => documents.push(document),
                Err(e) => {
                    tracing::warn!(collection = %collection, id = %id, "Skipping corrupt row: {}", e)
                }
            }
        }
        Ok(documents)
    }

    /// The stored session cookie, if present and unexpired at `now`
    pub async fn load_cookie(&self, now: DateTime<Utc>) -> Result<Option<SessionCookie>> {
        let row = sqlx::query("SELECT value, expires_at FROM cookies WHERE name = ?")
            .bind(TOKEN_COOKIE)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let token: String = row.try_get("value")?;
        let expires_at: String = row.try_get("expires_at")?;
        let expires_at = match DateTime::parse_from_rfc3339(&expires_at) {
            Ok(at) => at.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!("Discarding cookie with bad expiry: {}", e);
                self.apply(&[StorageOp::ClearCookie]).await?;
                return Ok(None);
            }
        };

        let cookie = SessionCookie { token, expires_at };
        if cookie.is_expired(now) {
            tracing::info!("Stored session cookie expired");
            self.apply(&[StorageOp::ClearCookie]).await?;
            return Ok(None);
        }
        Ok(Some(cookie))
    }

    /// Document counts per collection
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let rows = sqlx::query("SELECT collection, COUNT(*) AS count FROM documents GROUP BY collection")
            .fetch_all(&self.pool)
            .await?;

        let mut collections = BTreeMap::new();
        for row in rows {
            let collection: String = row.try_get("collection")?;
            let count: i64 = row.try_get("count")?;
            collections.insert(collection, count as u64);
        }
        Ok(DatabaseStats {
            documents: collections.values().sum(),
            collections,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseStats {
    /// Total number of persisted documents
    pub documents: u64,
    /// Persisted documents per collection
    pub collections: BTreeMap<String, u64>,
}
