//! Dispatcher
//!
//! The orchestrator of one client session. It owns every store, the
//! settings mirror, the user, the router and the outbound path, and routes
//! every server frame to the right place.
//!
//! The dispatcher performs no I/O. Frames to send accumulate in its
//! outbound queue ([`Dispatcher::take_outbound`]) and database writes in
//! its storage queue ([`Dispatcher::take_storage_ops`]); the session task
//! drains both after every step.
//!
//! ## Sync handshake
//!
//! On every (re)connection:
//!
//! 1. `settings.download`, applied to [`Settings`] when it arrives.
//! 2. The local database is already hydrated by the session.
//! 3. A manifest `{collection: {id: version}}` of retained collections.
//! 4. `dispatcher.sync` carrying the manifest.
//! 5. The reply declares how many catch-up operations will follow.
//! 6. Each `sync`-flagged mutation message counts toward that total;
//!    `Syncing` reports progress and `Synced` fires once when it is reached.
//!
//! Every handshake gets a new generation number so replies to a
//! superseded handshake are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::client::local_db::StorageOp;
use crate::client::outbound::{Outbound, Reply};
use crate::client::router::Router;
use crate::client::settings::Settings;
use crate::client::store::{default_collections, CollectionDefinition, LocalStore, StorePhase};
use crate::client::transaction::{Outcome, Responder, Transaction};
use crate::client::user::User;
use crate::shared::config::AppConfig;
use crate::shared::document::Document;
use crate::shared::error::{SyncError, TransactionError};
use crate::shared::event::{Emitter, ListenerId};
use crate::shared::protocol::{Inbound, Mutation, MutationData, OutboundRequest, TransactionReply};

/// Internal follow-up for a request the dispatcher made itself
#[derive(Debug)]
pub(crate) enum Continuation {
    SettingsDownload { generation: u64 },
    SyncManifest { generation: u64 },
    Login(Transaction),
}

impl Continuation {
    /// Settle a continuation the dispatcher can no longer act on
    pub(crate) fn abandon(self, outcome: Outcome) {
        match self {
            Continuation::Login(transaction) => transaction.respond(outcome),
            other => tracing::debug!(continuation = ?other, "Abandoned internal request"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherEventKind {
    Syncing,
    Synced,
    Closed,
    Ping,
    Logout,
    Authorized,
    SyncFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatcherEvent {
    Syncing { applied: u64, total: Option<u64> },
    Synced { applied: u64 },
    Closed,
    Ping,
    Logout { reason: Value },
    Authorized { name: Option<String> },
    /// The handshake was refused or timed out; the session reconnects
    SyncFailed { error: String },
}

impl DispatcherEvent {
    pub fn kind(&self) -> DispatcherEventKind {
        match self {
            DispatcherEvent::Syncing { .. } => DispatcherEventKind::Syncing,
            DispatcherEvent::Synced { .. } => DispatcherEventKind::Synced,
            DispatcherEvent::Closed => DispatcherEventKind::Closed,
            DispatcherEvent::Ping => DispatcherEventKind::Ping,
            DispatcherEvent::Logout { .. } => DispatcherEventKind::Logout,
            DispatcherEvent::Authorized { .. } => DispatcherEventKind::Authorized,
            DispatcherEvent::SyncFailed { .. } => DispatcherEventKind::SyncFailed,
        }
    }
}

/// State of the current sync handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub generation: u64,
    /// Sync-flagged operations applied so far
    pub applied: u64,
    /// Declared by the server; `None` until the `dispatcher.sync` reply
    pub total: Option<u64>,
    pub active: bool,
    pub complete: bool,
}

pub struct Dispatcher {
    config: AppConfig,
    outbound: Outbound,
    stores: BTreeMap<String, LocalStore>,
    settings: Settings,
    user: User,
    router: Router,
    progress: SyncProgress,
    connected: bool,
    reconnect_requested: bool,
    topics: BTreeSet<String>,
    storage: Vec<StorageOp>,
    events: Emitter<DispatcherEventKind, DispatcherEvent>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("server", &self.config.server_url)
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .field("progress", &self.progress)
            .field("connected", &self.connected)
            .field("outbound", &self.outbound)
            .finish()
    }
}

impl Dispatcher {
    /// Dispatcher mirroring the built-in collections
    pub fn new(config: AppConfig) -> Self {
        Self::with_definitions(config, default_collections())
    }

    pub fn with_definitions<I>(config: AppConfig, definitions: I) -> Self
    where
        I: IntoIterator<Item = CollectionDefinition>,
    {
        let stores = definitions
            .into_iter()
            .map(|definition| (definition.name.clone(), LocalStore::new(definition)))
            .collect();
        Self {
            outbound: Outbound::new(config.request_timeout),
            config,
            stores,
            settings: Settings::new(),
            user: User::new(),
            router: Router::default(),
            progress: SyncProgress::default(),
            connected: false,
            reconnect_requested: false,
            topics: BTreeSet::new(),
            storage: Vec::new(),
            events: Emitter::new(),
        }
    }

    // --- connection lifecycle ---

    /// The socket is open: mark stores syncing, restore topics, start the handshake
    pub fn on_open(&mut self) {
        tracing::info!(server = %self.config.server_url, "Connection open");
        self.connected = true;
        let topics: Vec<String> = self.topics.iter().cloned().collect();
        for topic in topics {
            self.send_topic_control("listen", &topic);
        }
        self.sync();
    }

    /// The socket closed: every pending request fails with `Disconnected`
    pub fn on_close(&mut self) {
        let was_connected = std::mem::replace(&mut self.connected, false);
        self.reconnect_requested = false;
        self.progress.generation += 1;
        self.progress.active = false;
        self.progress.complete = false;

        let discarded = self.outbound.discard_frames();
        let pending = self.outbound.drain_pending();
        tracing::info!(
            pending = pending.len(),
            discarded,
            was_connected,
            "Connection closed"
        );
        for (_, reply) in pending {
            self.settle(reply, Err(TransactionError::Disconnected));
        }
        self.emit(DispatcherEvent::Closed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// `true` once after a failed handshake: the transport should be dropped
    /// and reopened, which restarts the sync
    pub fn take_reconnect_request(&mut self) -> bool {
        std::mem::take(&mut self.reconnect_requested)
    }

    // --- sync ---

    /// Start a full sync handshake
    pub fn sync(&mut self) {
        self.progress = SyncProgress {
            generation: self.progress.generation + 1,
            applied: 0,
            total: None,
            active: true,
            complete: false,
        };
        let generation = self.progress.generation;
        tracing::info!(generation, "Starting sync");

        // Non-retained collections are resent in full.
        for store in self.stores.values_mut() {
            if !store.definition().retain && !store.is_empty() {
                store.clear();
            }
            store.set_phase(StorePhase::Syncing);
        }

        self.outbound.send_internal(
            OutboundRequest::new("settings", "download", Value::Null),
            Continuation::SettingsDownload { generation },
        );
        let manifest = self.manifest();
        self.outbound.send_internal(
            OutboundRequest::new("dispatcher", "sync", manifest),
            Continuation::SyncManifest { generation },
        );
        self.emit(DispatcherEvent::Syncing {
            applied: 0,
            total: None,
        });
    }

    /// `{collection: {id: version}}` for every retained collection
    pub fn manifest(&self) -> Value {
        let manifest: Map<String, Value> = self
            .stores
            .values()
            .filter(|store| store.definition().retain)
            .map(|store| (store.name().to_string(), json!(store.manifest())))
            .collect();
        Value::Object(manifest)
    }

    pub fn sync_progress(&self) -> SyncProgress {
        self.progress
    }

    pub fn is_synced(&self) -> bool {
        self.progress.complete
    }

    fn note_sync_operation(&mut self) {
        if !self.progress.active {
            tracing::debug!("Sync operation outside an active handshake");
            return;
        }
        self.progress.applied += 1;
        self.emit(DispatcherEvent::Syncing {
            applied: self.progress.applied,
            total: self.progress.total,
        });
        self.check_sync_complete();
    }

    fn check_sync_complete(&mut self) {
        let Some(total) = self.progress.total else {
            return;
        };
        if !self.progress.active || self.progress.applied < total {
            return;
        }
        self.progress.active = false;
        self.progress.complete = true;
        for store in self.stores.values_mut() {
            store.set_phase(StorePhase::Synced);
        }
        tracing::info!(
            generation = self.progress.generation,
            applied = self.progress.applied,
            "Sync complete"
        );
        self.emit(DispatcherEvent::Synced {
            applied: self.progress.applied,
        });
    }

    // --- inbound ---

    /// Parse and handle a text frame. Malformed frames are logged and dropped.
    pub fn handle_text(&mut self, text: &str) {
        match Inbound::parse(text) {
            Ok(inbound) => self.handle(inbound),
            Err(e) => tracing::warn!("Dropping frame: {}", e),
        }
    }

    pub fn handle(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Collection {
                mutation,
                collection,
                data,
                sync,
            } => {
                self.apply_mutation(mutation, &collection, data);
                if sync {
                    self.note_sync_operation();
                }
            }
            Inbound::Transaction(reply) => self.resolve(reply),
            Inbound::Ping => {
                tracing::trace!("Ping");
                self.emit(DispatcherEvent::Ping);
            }
            Inbound::Set(data) => self.settings.update(data),
            Inbound::Amend(data) => self.load_user(data),
            Inbound::Deauthorize(reason) => self.deauthorize(reason),
            Inbound::Unknown { operation } => {
                tracing::warn!(operation = %operation, "Ignoring unknown operation")
            }
        }
    }

    fn apply_mutation(&mut self, mutation: Mutation, collection: &str, data: MutationData) {
        let Some(store) = self.stores.get_mut(collection) else {
            tracing::warn!(collection = %collection, ?mutation, "Mutation for unknown collection");
            return;
        };
        tracing::debug!(collection = %collection, ?mutation, "Applying mutation");
        match (mutation, data) {
            (Mutation::Add | Mutation::Update, MutationData::Documents(documents)) => {
                store.bulk_upsert(documents);
            }
            (Mutation::Remove, MutationData::Ids(ids)) => {
                store.remove(ids);
            }
            (mutation, _) => {
                tracing::warn!(collection = %collection, ?mutation, "Mismatched mutation payload");
            }
        }
        self.storage.extend(store.take_storage_ops());
    }

    fn resolve(&mut self, reply: TransactionReply) {
        let TransactionReply { tid, success, data } = reply;
        let Some(pending) = self.outbound.take(tid) else {
            tracing::warn!(tid, "Reply for unknown transaction");
            return;
        };
        tracing::debug!(tid, success, "Resolving transaction");
        let outcome = if success {
            Ok(data)
        } else {
            Err(TransactionError::Failed(data))
        };
        self.settle(pending, outcome);
    }

    fn settle(&mut self, reply: Reply, outcome: Outcome) {
        match reply {
            Reply::Caller(transaction) => transaction.respond(outcome),
            Reply::Internal(continuation) => self.continue_with(continuation, outcome),
        }
    }

    fn continue_with(&mut self, continuation: Continuation, outcome: Outcome) {
        match continuation {
            Continuation::SettingsDownload { generation } => {
                if generation != self.progress.generation {
                    tracing::debug!(generation, "Ignoring settings from superseded sync");
                    return;
                }
                match outcome {
                    Ok(settings) => self.settings.update(settings),
                    Err(e) => tracing::warn!("Settings download failed: {}", e),
                }
            }
            Continuation::SyncManifest { generation } => {
                if generation != self.progress.generation {
                    tracing::debug!(generation, "Ignoring reply to superseded sync");
                    return;
                }
                match outcome {
                    Ok(reply) => {
                        let total = declared_total(&reply).unwrap_or_else(|| {
                            tracing::warn!(reply = %reply, "Sync reply without a count, assuming 0");
                            0
                        });
                        tracing::info!(generation, total, "Server declared sync total");
                        self.progress.total = Some(total);
                        self.emit(DispatcherEvent::Syncing {
                            applied: self.progress.applied,
                            total: Some(total),
                        });
                        self.check_sync_complete();
                    }
                    // Closing already fails the handshake and resyncs on reopen.
                    Err(TransactionError::Disconnected) => self.progress.active = false,
                    Err(e) => {
                        tracing::error!(generation, "Sync handshake failed: {}", e);
                        self.progress.active = false;
                        if self.connected {
                            self.reconnect_requested = true;
                        }
                        self.emit(DispatcherEvent::SyncFailed { error: e.to_string() });
                    }
                }
            }
            Continuation::Login(transaction) => {
                if let Ok(payload) = &outcome {
                    self.authorize(payload.clone());
                }
                transaction.respond(outcome);
            }
        }
    }

    // --- outbound ---

    /// Send a raw request; the single path to the server
    pub fn send(&mut self, request: OutboundRequest) -> Transaction {
        self.outbound.send(request)
    }

    pub fn request(&mut self, collection: &str, method: &str, data: Value) -> Transaction {
        match self.stores.get(collection) {
            Some(store) => store.request(&mut self.outbound, method, data),
            None => self.send(OutboundRequest::new(collection, method, data)),
        }
    }

    pub fn set_setting(&mut self, key: &str, value: Value) -> Transaction {
        self.settings.set(&mut self.outbound, key, value)
    }

    /// Subscribe to a server-push topic. Topics survive reconnects.
    pub fn listen(&mut self, name: &str) -> bool {
        let added = self.topics.insert(name.to_string());
        if added && self.connected {
            self.send_topic_control("listen", name);
        }
        added
    }

    pub fn unlisten(&mut self, name: &str) -> bool {
        let removed = self.topics.remove(name);
        if removed && self.connected {
            self.send_topic_control("unlisten", name);
        }
        removed
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    fn send_topic_control(&mut self, method: &str, name: &str) {
        let transaction = self.send(OutboundRequest::new("dispatcher", method, json!({ "name": name })));
        let topic = name.to_string();
        let method = method.to_string();
        transaction.failure(move |payload| {
            tracing::warn!(topic = %topic, method = %method, payload = %payload, "Topic request failed")
        });
    }

    /// Fail requests that outlived the configured timeout. Returns how many expired.
    pub fn expire_transactions(&mut self, now: Instant) -> usize {
        let expired = self.outbound.expire(now);
        let count = expired.len();
        for (tid, reply) in expired {
            tracing::warn!(tid, "Request timed out");
            self.settle(reply, Err(TransactionError::Timeout));
        }
        count
    }

    /// Frames to write to the socket, in send order
    pub fn take_outbound(&mut self) -> Vec<String> {
        self.outbound.take_frames()
    }

    /// Database writes to apply, in order
    pub fn take_storage_ops(&mut self) -> Vec<StorageOp> {
        std::mem::take(&mut self.storage)
    }

    pub fn pending_requests(&self) -> usize {
        self.outbound.pending()
    }

    // --- session ---

    /// `users.authorize`; on success the user is loaded and the collections resynced
    pub fn login(&mut self, username: &str, password: &str) -> Transaction {
        let transaction = Transaction::new();
        let request = OutboundRequest::new(
            "users",
            "authorize",
            json!({ "username": username, "password": password }),
        );
        if let Some(tid) = self
            .outbound
            .send_internal(request, Continuation::Login(transaction.clone()))
        {
            transaction.set_tid(tid);
        }
        transaction
    }

    pub fn logout(&mut self) -> Transaction {
        self.user.logout(&mut self.outbound)
    }

    /// Load a session payload and resync everything
    pub fn authorize(&mut self, payload: Value) {
        self.load_user(payload);
        tracing::info!(user = ?self.user.name(), "Authorized");
        self.emit(DispatcherEvent::Authorized {
            name: self.user.name().map(str::to_string),
        });
        if self.connected {
            self.sync();
        }
    }

    fn load_user(&mut self, payload: Value) {
        if let Some(cookie) = self.user.load(payload, Utc::now()) {
            self.storage.push(StorageOp::SaveCookie(cookie));
        }
    }

    /// Forget the session: persisted documents and cookie, store contents,
    /// user state, settings and navigation
    pub fn deauthorize(&mut self, reason: Value) {
        tracing::info!(reason = %reason, "Deauthorized");
        self.storage.push(StorageOp::ClearDocuments);
        self.storage.push(StorageOp::ClearCookie);
        self.user.reset(reason.clone());
        self.settings.clear();
        for store in self.stores.values_mut() {
            store.clear();
            store.take_storage_ops();
        }
        self.progress = SyncProgress {
            generation: self.progress.generation + 1,
            ..SyncProgress::default()
        };
        self.router.reset();
        self.emit(DispatcherEvent::Logout { reason });
    }

    /// Load persisted documents into a store without re-persisting them
    pub fn hydrate(&mut self, collection: &str, documents: Vec<Document>) -> Result<usize, SyncError> {
        let store = self
            .stores
            .get_mut(collection)
            .ok_or_else(|| SyncError::UnknownCollection(collection.to_string()))?;
        let summary = store.hydrate(documents);
        tracing::debug!(collection = %collection, loaded = summary.added + summary.updated, "Hydrated store");
        Ok(summary.added + summary.updated)
    }

    // --- accessors ---

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self, name: &str) -> Option<&LocalStore> {
        self.stores.get(name)
    }

    /// Mutable access for subscribing to store events
    pub fn store_mut(&mut self, name: &str) -> Option<&mut LocalStore> {
        self.stores.get_mut(name)
    }

    pub fn stores(&self) -> impl Iterator<Item = &LocalStore> {
        self.stores.values()
    }

    pub fn retained_collections(&self) -> Vec<String> {
        self.stores
            .values()
            .filter(|store| store.definition().retain)
            .map(|store| store.name().to_string())
            .collect()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn user_mut(&mut self) -> &mut User {
        &mut self.user
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn on<F>(&mut self, kind: DispatcherEventKind, handler: F) -> ListenerId
    where
        F: FnMut(&DispatcherEvent) + Send + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    fn emit(&mut self, event: DispatcherEvent) {
        self.events.emit(event.kind(), &event);
    }
}

/// Total catch-up operations from a `dispatcher.sync` reply: `n` or `{"count": n}`
fn declared_total(reply: &Value) -> Option<u64> {
    match reply {
        Value::Number(n) => n.as_u64(),
        Value::Object(map) => map.get("count").and_then(Value::as_u64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::router::LANDING_SUBSECTION;
    use crate::client::store::StoreEventKind;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn dispatcher() -> Dispatcher {
        let config = AppConfig::builder()
            .request_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        Dispatcher::with_definitions(
            config,
            vec![
                CollectionDefinition::new("jobs").retained(true),
                CollectionDefinition::new("viruses").unique(&["name"]).retained(true),
                CollectionDefinition::new("users"),
            ],
        )
    }

    fn frames(dispatcher: &mut Dispatcher) -> Vec<Value> {
        dispatcher
            .take_outbound()
            .iter()
            .map(|frame| serde_json::from_str(frame).unwrap())
            .collect()
    }

    fn tid_of(frames: &[Value], collection: &str, method: &str) -> u64 {
        frames
            .iter()
            .find(|f| f["collectionName"] == collection && f["methodName"] == method)
            .and_then(|f| f["tid"].as_u64())
            .unwrap()
    }

    fn reply(tid: u64, success: bool, data: Value) -> String {
        json!({"operation": "transaction", "data": {"tid": tid, "success": success, "data": data}})
            .to_string()
    }

    fn record(dispatcher: &mut Dispatcher, kind: DispatcherEventKind) -> Arc<Mutex<Vec<DispatcherEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[test]
    fn test_remove_job_round_trip() {
        let mut dispatcher = dispatcher();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        dispatcher
            .request("jobs", "remove_job", json!({"_id": ["x"]}))
            .success(move |data| sink.lock().unwrap().push(data));

        let sent = frames(&mut dispatcher);
        assert_eq!(sent[0]["data"], json!({"_id": ["x"]}));
        let tid = tid_of(&sent, "jobs", "remove_job");

        dispatcher.handle_text(&reply(tid, true, json!({"removed": ["x"]})));
        assert_eq!(received.lock().unwrap().as_slice(), &[json!({"removed": ["x"]})]);
        assert_eq!(dispatcher.pending_requests(), 0);

        // A duplicate reply is ignored.
        dispatcher.handle_text(&reply(tid, true, json!(null)));
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failure_reply_reaches_failure_callback() {
        let mut dispatcher = dispatcher();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        dispatcher
            .request("viruses", "create", json!({"name": ""}))
            .failure(move |payload| sink.lock().unwrap().push(payload));
        let tid = tid_of(&frames(&mut dispatcher), "viruses", "create");

        dispatcher.handle_text(&reply(tid, false, json!({"name": ["required"]})));
        assert_eq!(errors.lock().unwrap()[0], json!({"name": ["required"]}));
    }

    #[test]
    fn test_stale_update_is_ignored() {
        let mut dispatcher = dispatcher();
        dispatcher
            .hydrate("jobs", vec![Document::from_value(json!({"_id": "x", "_version": 3, "state": "running"})).unwrap()])
            .unwrap();
        let changes = Arc::new(Mutex::new(0));
        let counter = changes.clone();
        dispatcher
            .store_mut("jobs")
            .unwrap()
            .on(StoreEventKind::Change, move |_| *counter.lock().unwrap() += 1);

        dispatcher.handle_text(
            &json!({"operation": "update", "collection_name": "jobs", "data": {"_id": "x", "_version": 2, "state": "waiting"}})
                .to_string(),
        );

        let job = dispatcher.store("jobs").unwrap().get("x").unwrap();
        assert_eq!(job.get("state"), Some(&json!("running")));
        assert_eq!(*changes.lock().unwrap(), 0);
        assert!(dispatcher.take_storage_ops().is_empty());
    }

    #[test]
    fn test_sync_of_five_operations_emits_synced_once() {
        let mut dispatcher = dispatcher();
        let synced = record(&mut dispatcher, DispatcherEventKind::Synced);
        let syncing = record(&mut dispatcher, DispatcherEventKind::Syncing);

        dispatcher.on_open();
        assert_eq!(dispatcher.store("jobs").unwrap().phase(), StorePhase::Syncing);
        let sent = frames(&mut dispatcher);
        let settings_tid = tid_of(&sent, "settings", "download");
        let sync_tid = tid_of(&sent, "dispatcher", "sync");
        assert_eq!(sent[1]["data"], json!({"jobs": {}, "viruses": {}}));

        dispatcher.handle_text(&reply(settings_tid, true, json!({"sample_group": "none"})));
        dispatcher.handle_text(&reply(sync_tid, true, json!(5)));

        for i in 0..5 {
            dispatcher.handle_text(
                &json!({"operation": "add", "collection_name": "jobs", "sync": true, "data": {"_id": format!("j{}", i)}})
                    .to_string(),
            );
        }
        // A late sync-flagged message does not re-emit.
        dispatcher.handle_text(
            &json!({"operation": "add", "collection_name": "jobs", "sync": true, "data": {"_id": "extra"}}).to_string(),
        );

        assert_eq!(synced.lock().unwrap().as_slice(), &[DispatcherEvent::Synced { applied: 5 }]);
        assert!(syncing.lock().unwrap().contains(&DispatcherEvent::Syncing {
            applied: 3,
            total: Some(5)
        }));
        assert_eq!(dispatcher.store("jobs").unwrap().len(), 6);
        assert_eq!(dispatcher.store("jobs").unwrap().phase(), StorePhase::Synced);
        assert_eq!(dispatcher.settings().get("sample_group"), Some(&json!("none")));
    }

    #[test]
    fn test_sync_messages_before_total() {
        let mut dispatcher = dispatcher();
        let synced = record(&mut dispatcher, DispatcherEventKind::Synced);
        dispatcher.on_open();
        let sync_tid = tid_of(&frames(&mut dispatcher), "dispatcher", "sync");

        for id in ["a", "b"] {
            dispatcher.handle_text(
                &json!({"operation": "remove", "collection_name": "jobs", "sync": true, "data": [id]}).to_string(),
            );
        }
        assert!(synced.lock().unwrap().is_empty());

        dispatcher.handle_text(&reply(sync_tid, true, json!({"count": 2})));
        assert_eq!(synced.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_zero_total_syncs_immediately() {
        let mut dispatcher = dispatcher();
        dispatcher.on_open();
        let sync_tid = tid_of(&frames(&mut dispatcher), "dispatcher", "sync");
        dispatcher.handle_text(&reply(sync_tid, true, json!(0)));
        assert!(dispatcher.is_synced());
    }

    #[test]
    fn test_superseded_sync_reply_is_ignored() {
        let mut dispatcher = dispatcher();
        dispatcher.on_open();
        let old_tid = tid_of(&frames(&mut dispatcher), "dispatcher", "sync");
        dispatcher.sync();
        let new_tid = tid_of(&frames(&mut dispatcher), "dispatcher", "sync");

        dispatcher.handle_text(&reply(old_tid, true, json!(0)));
        assert!(!dispatcher.is_synced());
        dispatcher.handle_text(&reply(new_tid, true, json!(0)));
        assert!(dispatcher.is_synced());
    }

    #[test]
    fn test_manifest_reflects_local_versions() {
        let mut dispatcher = dispatcher();
        dispatcher
            .hydrate("viruses", vec![Document::from_value(json!({"_id": "v1", "_version": 7, "name": "TMV"})).unwrap()])
            .unwrap();
        assert_eq!(dispatcher.manifest(), json!({"jobs": {}, "viruses": {"v1": 7}}));
        assert_matches!(
            dispatcher.hydrate("nothing", Vec::new()),
            Err(SyncError::UnknownCollection(name)) if name == "nothing"
        );
    }

    #[test]
    fn test_close_fails_pending_with_disconnected() {
        let mut dispatcher = dispatcher();
        let closed = record(&mut dispatcher, DispatcherEventKind::Closed);
        dispatcher.on_open();
        let mut receiver = dispatcher.request("jobs", "cancel", json!({"_id": "x"})).outcome();

        dispatcher.on_close();

        assert_eq!(receiver.try_recv().unwrap(), Err(TransactionError::Disconnected));
        assert_eq!(dispatcher.pending_requests(), 0);
        assert!(dispatcher.take_outbound().is_empty());
        assert_eq!(closed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_refused_sync_requests_reconnect() {
        let mut dispatcher = dispatcher();
        let failed = record(&mut dispatcher, DispatcherEventKind::SyncFailed);
        dispatcher.on_open();
        let sent = frames(&mut dispatcher);
        assert!(!dispatcher.take_reconnect_request());

        dispatcher.handle_text(&reply(tid_of(&sent, "dispatcher", "sync"), false, json!("busy")));

        assert_matches!(failed.lock().unwrap().as_slice(), [DispatcherEvent::SyncFailed { .. }]);
        assert!(!dispatcher.is_synced());
        assert!(dispatcher.take_reconnect_request());
        assert!(!dispatcher.take_reconnect_request());

        // The reopened connection runs a fresh handshake.
        dispatcher.on_close();
        dispatcher.on_open();
        let sent = frames(&mut dispatcher);
        dispatcher.handle_text(&reply(tid_of(&sent, "dispatcher", "sync"), true, json!(0)));
        assert!(dispatcher.is_synced());
    }

    #[test]
    fn test_timed_out_sync_requests_reconnect() {
        let mut dispatcher = dispatcher();
        dispatcher.on_open();
        frames(&mut dispatcher);

        dispatcher.expire_transactions(Instant::now() + Duration::from_secs(6));

        assert!(dispatcher.take_reconnect_request());
        assert_eq!(dispatcher.store("jobs").unwrap().phase(), StorePhase::Syncing);
    }

    #[test]
    fn test_oversized_timeout_does_not_panic() {
        let config = AppConfig::builder()
            .request_timeout(Duration::from_secs(u64::MAX))
            .build()
            .unwrap();
        let mut dispatcher = Dispatcher::new(config);
        dispatcher.request("jobs", "cancel", json!({"_id": "x"}));

        assert_eq!(dispatcher.pending_requests(), 1);
        assert_eq!(dispatcher.expire_transactions(Instant::now() + Duration::from_secs(3600)), 0);
    }

    #[test]
    fn test_expired_requests_fail_with_timeout() {
        let mut dispatcher = dispatcher();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        dispatcher
            .request("jobs", "cancel", json!({"_id": "x"}))
            .failure(move |payload| sink.lock().unwrap().push(payload));

        assert_eq!(dispatcher.expire_transactions(Instant::now()), 0);
        let expired = dispatcher.expire_transactions(Instant::now() + Duration::from_secs(6));
        assert_eq!(expired, 1);
        assert_eq!(failures.lock().unwrap()[0], json!({"reason": "timeout"}));
    }

    #[test]
    fn test_login_authorizes_and_resyncs() {
        let mut dispatcher = dispatcher();
        let authorized = record(&mut dispatcher, DispatcherEventKind::Authorized);
        dispatcher.on_open();
        frames(&mut dispatcher);

        let mut outcome = dispatcher.login("bob", "hunter2").outcome();
        let sent = frames(&mut dispatcher);
        assert_eq!(sent[0]["data"], json!({"username": "bob", "password": "hunter2"}));
        let tid = tid_of(&sent, "users", "authorize");

        dispatcher.handle_text(&reply(tid, true, json!({"_id": "bob", "token": "t0k", "permissions": {}})));

        assert_eq!(dispatcher.user().name(), Some("bob"));
        assert!(outcome.try_recv().unwrap().is_ok());
        assert_eq!(
            authorized.lock().unwrap().as_slice(),
            &[DispatcherEvent::Authorized { name: Some("bob".into()) }]
        );
        assert_matches!(dispatcher.take_storage_ops().as_slice(), [StorageOp::SaveCookie(c)] if c.token == "t0k");
        let resync = frames(&mut dispatcher);
        tid_of(&resync, "dispatcher", "sync");
    }

    #[test]
    fn test_failed_login_reports_to_caller() {
        let mut dispatcher = dispatcher();
        let mut outcome = dispatcher.login("bob", "wrong").outcome();
        let tid = tid_of(&frames(&mut dispatcher), "users", "authorize");
        dispatcher.handle_text(&reply(tid, false, json!({"message": "Invalid credentials"})));
        assert_matches!(outcome.try_recv().unwrap(), Err(TransactionError::Failed(_)));
        assert!(!dispatcher.user().is_authenticated());
    }

    #[test]
    fn test_deauthorize_clears_everything() {
        let mut dispatcher = dispatcher();
        let logouts = record(&mut dispatcher, DispatcherEventKind::Logout);
        dispatcher.handle_text(&json!({"operation": "amend", "data": {"_id": "bob", "token": "t"}}).to_string());
        dispatcher.handle_text(
            &json!({"operation": "add", "collection_name": "jobs", "data": [{"_id": "a"}, {"_id": "b"}]}).to_string(),
        );
        dispatcher.handle_text(&json!({"operation": "set", "data": {"sample_group": "none"}}).to_string());
        dispatcher.router_mut().navigate("#jobs/detail/a");
        dispatcher.take_storage_ops();

        dispatcher.handle_text(&json!({"operation": "deauthorize", "data": "session expired"}).to_string());

        assert!(dispatcher.store("jobs").unwrap().is_empty());
        assert_eq!(dispatcher.store("jobs").unwrap().phase(), StorePhase::Uninitialized);
        assert!(!dispatcher.user().is_authenticated());
        assert_eq!(dispatcher.router().route().subsection, LANDING_SUBSECTION);
        assert!(dispatcher.settings().as_map().is_empty());
        assert_eq!(
            dispatcher.take_storage_ops(),
            vec![StorageOp::ClearDocuments, StorageOp::ClearCookie]
        );
        assert_eq!(logouts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_topics_survive_reconnect() {
        let mut dispatcher = dispatcher();
        assert!(dispatcher.listen("status"));
        assert!(!dispatcher.listen("status"));
        assert!(frames(&mut dispatcher).is_empty());

        dispatcher.on_open();
        let sent = frames(&mut dispatcher);
        assert_eq!(sent[0]["methodName"], "listen");
        assert_eq!(sent[0]["data"], json!({"name": "status"}));

        assert!(dispatcher.unlisten("status"));
        assert_eq!(frames(&mut dispatcher)[0]["methodName"], "unlisten");
        assert_eq!(dispatcher.topics().count(), 0);
    }

    #[test]
    fn test_bad_frames_are_not_fatal() {
        let mut dispatcher = dispatcher();
        let pings = record(&mut dispatcher, DispatcherEventKind::Ping);
        dispatcher.handle_text("not json");
        dispatcher.handle_text(r#"{"operation": "reticulate"}"#);
        dispatcher.handle_text(r#"{"operation": "add", "collection_name": "nowhere", "data": {"_id": "x"}}"#);
        dispatcher.handle_text(r#"{"operation": "ping"}"#);
        assert_eq!(pings.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_set_message_updates_settings() {
        let mut dispatcher = dispatcher();
        dispatcher.handle_text(r#"{"operation": "set", "data": {"max_threads": 8}}"#);
        assert_eq!(dispatcher.settings().get("max_threads"), Some(&json!(8)));

        dispatcher.set_setting("max_threads", json!(16));
        let sent = frames(&mut dispatcher);
        assert_eq!(sent[0]["collectionName"], "settings");
        assert_eq!(dispatcher.settings().get("max_threads"), Some(&json!(8)));
    }

    #[test]
    fn test_declared_total_shapes() {
        assert_eq!(declared_total(&json!(4)), Some(4));
        assert_eq!(declared_total(&json!({"count": 9})), Some(9));
        assert_eq!(declared_total(&json!("many")), None);
    }
}
