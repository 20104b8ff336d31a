//! Session actor
//!
//! One tokio task owns the [`Dispatcher`], the local database and the
//! transport. Socket frames, consumer commands and timer ticks are handled
//! one at a time in arrival order, so no lock ever guards store state.
//!
//! Consumers talk to the actor through a cloneable [`SessionHandle`]:
//! [`SessionHandle::call`] runs a closure against the dispatcher and awaits
//! its result, [`SessionHandle::post`] runs it without waiting. Callbacks
//! registered on dispatcher objects run on the actor and may `post` through
//! a cloned handle.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), virtool_sync::shared::SyncError> {
//! use serde_json::json;
//! use virtool_sync::client::session;
//! use virtool_sync::shared::AppConfig;
//!
//! let (handle, task) = session::start(AppConfig::load(None)?).await?;
//! handle.wait_synced().await?;
//! let running = handle
//!     .call(|d| d.store("jobs").map(|jobs| jobs.find(&json!({"state": "running"})).map(|c| c.count())))
//!     .await?;
//! println!("{:?} running jobs", running);
//! handle.shutdown();
//! let _ = task.await;
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::client::connection::{Backoff, Connection, Connector, WsConnector};
use crate::client::dispatcher::{Dispatcher, DispatcherEventKind};
use crate::client::local_db::{LocalDatabase, StorageOp};
use crate::client::user::SessionCookie;
use crate::shared::config::AppConfig;
use crate::shared::error::SyncError;

/// How often pending requests are checked for timeouts
const TICK_INTERVAL: Duration = Duration::from_secs(1);

type Command = Box<dyn FnOnce(&mut Dispatcher) + Send>;

enum SessionMessage {
    Run(Command),
    Shutdown,
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl SessionHandle {
    /// Run `f` on the actor and return its result
    pub async fn call<F, T>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Dispatcher) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.post(move |dispatcher| {
            // The caller may have stopped waiting.
            let _ = reply.send(f(dispatcher));
        })?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Run `f` on the actor without waiting
    pub fn post<F>(&self, f: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut Dispatcher) + Send + 'static,
    {
        self.tx
            .send(SessionMessage::Run(Box::new(f)))
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Resolve once the current (or next) sync handshake completes
    pub async fn wait_synced(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.post(move |dispatcher| {
            if dispatcher.is_synced() {
                let _ = tx.send(());
                return;
            }
            let mut tx = Some(tx);
            dispatcher.on(DispatcherEventKind::Synced, move |_| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
            });
        })?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Stop the actor; pending requests fail with `Disconnected`
    pub fn shutdown(&self) {
        let _ = self.tx.send(SessionMessage::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Open the configured database and connect over WebSocket
pub async fn start(config: AppConfig) -> Result<(SessionHandle, JoinHandle<()>), SyncError> {
    config.validate()?;
    let database = LocalDatabase::open(&config).await?;
    let connector = WsConnector::from_config(&config);
    let backoff = Backoff::from_config(&config);
    Ok(spawn(Dispatcher::new(config), connector, Some(database), backoff))
}

/// Start the actor on the current runtime
pub fn spawn<C: Connector>(
    dispatcher: Dispatcher,
    connector: C,
    database: Option<LocalDatabase>,
    backoff: Backoff,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session {
        dispatcher,
        connector,
        database,
        backoff,
        cookie: None,
        rx,
    };
    let task = tokio::spawn(session.run());
    (SessionHandle { tx }, task)
}

/// Why a connected loop ended
enum Exit {
    Disconnected,
    Shutdown,
}

struct Session<C> {
    dispatcher: Dispatcher,
    connector: C,
    database: Option<LocalDatabase>,
    backoff: Backoff,
    cookie: Option<SessionCookie>,
    rx: mpsc::UnboundedReceiver<SessionMessage>,
}

impl<C: Connector> Session<C> {
    async fn run(mut self) {
        self.hydrate().await;

        loop {
            match self.connector.connect(self.cookie.clone()).await {
                Ok(connection) => {
                    let span = tracing::info_span!("connection", id = %connection.id);
                    let exit = self.serve(connection).instrument(span).await;
                    self.dispatcher.on_close();
                    self.persist().await;
                    if matches!(exit, Exit::Shutdown) {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Connection failed: {}", e),
            }

            let delay = self.backoff.next_delay();
            tracing::info!(attempt = self.backoff.attempt(), ?delay, "Reconnecting after delay");
            if matches!(self.pause(delay).await, Exit::Shutdown) {
                self.dispatcher.on_close();
                self.persist().await;
                break;
            }
        }
        tracing::info!("Session stopped");
    }

    /// Load retained collections and the session cookie from disk
    async fn hydrate(&mut self) {
        let Some(database) = &self.database else {
            return;
        };
        for collection in self.dispatcher.retained_collections() {
            match database.load_collection(&collection).await {
                Ok(documents) => {
                    if let Err(e) = self.dispatcher.hydrate(&collection, documents) {
                        tracing::warn!(collection = %collection, "Hydration failed: {}", e);
                    }
                }
                Err(e) => tracing::error!(collection = %collection, "Could not read local documents: {}", e),
            }
        }
        match database.load_cookie(Utc::now()).await {
            Ok(cookie) => self.cookie = cookie,
            Err(e) => tracing::error!("Could not read session cookie: {}", e),
        }
    }

    /// Drive one open connection until it closes or the session stops
    async fn serve(&mut self, mut connection: Connection) -> Exit {
        self.dispatcher.on_open();
        if !self.flush(&connection).await {
            return Exit::Disconnected;
        }

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                frame = connection.incoming.recv() => match frame {
                    Some(text) => self.dispatcher.handle_text(&text),
                    None => return Exit::Disconnected,
                },
                message = self.rx.recv() => match message {
                    Some(SessionMessage::Run(command)) => command(&mut self.dispatcher),
                    Some(SessionMessage::Shutdown) | None => return Exit::Shutdown,
                },
                _ = tick.tick() => {
                    self.dispatcher.expire_transactions(Instant::now());
                }
            }
            if !self.flush(&connection).await {
                return Exit::Disconnected;
            }
            if self.dispatcher.take_reconnect_request() {
                tracing::warn!("Sync failed, dropping connection");
                return Exit::Disconnected;
            }
            // A connection only counts as healthy once it has synced.
            if self.dispatcher.is_synced() && self.backoff.attempt() > 0 {
                self.backoff.reset();
            }
        }
    }

    /// Wait out a reconnect delay while still serving commands
    async fn pause(&mut self, delay: Duration) -> Exit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut sleep => return Exit::Disconnected,
                message = self.rx.recv() => match message {
                    Some(SessionMessage::Run(command)) => command(&mut self.dispatcher),
                    Some(SessionMessage::Shutdown) | None => return Exit::Shutdown,
                },
                _ = tick.tick() => {
                    self.dispatcher.expire_transactions(Instant::now());
                }
            }
            self.persist().await;
        }
    }

    /// Persist, then write queued frames. `false` once the socket is gone.
    async fn flush(&mut self, connection: &Connection) -> bool {
        self.persist().await;
        for frame in self.dispatcher.take_outbound() {
            if connection.outgoing.send(frame).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn persist(&mut self) {
        let ops = self.dispatcher.take_storage_ops();
        if ops.is_empty() {
            return;
        }
        for op in &ops {
            match op {
                StorageOp::SaveCookie(cookie) => self.cookie = Some(cookie.clone()),
                StorageOp::ClearCookie => self.cookie = None,
                _ => {}
            }
        }
        if let Some(database) = &self.database {
            if let Err(e) = database.apply(&ops).await {
                tracing::error!(ops = ops.len(), "Could not persist changes: {}", e);
            }
        }
    }
}
