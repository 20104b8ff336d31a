//! Local Document Store
//!
//! One [`LocalStore`] mirrors one server collection. Stores are owned by the
//! dispatcher and only mutated by inbound messages and local hydration;
//! consumers read through [`LocalStore::find`], [`LocalStore::by`] and
//! [`LocalStore::get`] and subscribe to change events.
//!
//! ## Versioning
//!
//! Documents carry a `_version`. An incoming document replaces the stored
//! one only when its version is greater than or equal to the stored
//! version; older documents are dropped. With equal versions the last one
//! applied wins.
//!
//! ## Events
//!
//! Each batch emits `Add` (new ids) and/or `Update` (replaced ids), then a
//! single `Change`. Removals emit `Remove` then `Change`. Nothing is emitted
//! for a batch that changed nothing.

pub mod collections;
pub mod cursor;
pub mod query;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::client::local_db::StorageOp;
use crate::client::outbound::Outbound;
use crate::client::transaction::Transaction;
use crate::shared::document::{Document, ID_FIELD};
use crate::shared::error::SyncError;
use crate::shared::event::{Emitter, ListenerId};
use crate::shared::protocol::OutboundRequest;

pub use collections::default_collections;
pub use cursor::Cursor;
pub use query::Query;

/// Static description of a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDefinition {
    pub name: String,
    /// Fields whose values must be distinct across documents, beyond `_id`
    pub unique: Vec<String>,
    /// Fields indexed for equality lookups
    pub indices: Vec<String>,
    /// Persist between sessions
    pub retain: bool,
}

impl CollectionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique: Vec::new(),
            indices: Vec::new(),
            retain: false,
        }
    }

    pub fn unique(mut self, fields: &[&str]) -> Self {
        self.unique = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn indexed(mut self, fields: &[&str]) -> Self {
        self.indices = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Lifecycle of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorePhase {
    #[default]
    Uninitialized,
    Syncing,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEventKind {
    Add,
    Update,
    Remove,
    Change,
}

/// Payload delivered to store listeners
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreEvent {
    pub collection: String,
    /// Documents added or replaced
    pub documents: Vec<Document>,
    /// Ids removed
    pub removed: Vec<String>,
}

/// What a batch upsert did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub added: usize,
    pub updated: usize,
    pub stale: usize,
    /// Documents dropped because an incoming document took their unique value
    pub evicted: usize,
}

impl UpsertSummary {
    pub fn changed(&self) -> bool {
        self.added + self.updated > 0
    }
}

/// In-memory mirror of one collection
#[derive(Debug)]
pub struct LocalStore {
    definition: CollectionDefinition,
    documents: BTreeMap<String, Document>,
    /// unique field -> value key -> owning id
    unique: HashMap<String, HashMap<String, String>>,
    /// indexed field -> value key -> ids
    indices: HashMap<String, HashMap<String, BTreeSet<String>>>,
    phase: StorePhase,
    events: Emitter<StoreEventKind, StoreEvent>,
    storage: Vec<StorageOp>,
}

impl LocalStore {
    pub fn new(definition: CollectionDefinition) -> Self {
        let unique = definition
            .unique
            .iter()
            .map(|field| (field.clone(), HashMap::new()))
            .collect();
        let indices = definition
            .unique
            .iter()
            .chain(definition.indices.iter())
            .map(|field| (field.clone(), HashMap::new()))
            .collect();
        Self {
            definition,
            documents: BTreeMap::new(),
            unique,
            indices,
            phase: StorePhase::Uninitialized,
            events: Emitter::new(),
            storage: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &CollectionDefinition {
        &self.definition
    }

    pub fn phase(&self) -> StorePhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: StorePhase) {
        if self.phase != phase {
            tracing::debug!(collection = %self.definition.name, ?phase, "Store phase changed");
            self.phase = phase;
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    /// Upsert a single document
    pub fn insert(&mut self, document: Document) -> UpsertSummary {
        self.bulk_upsert(std::iter::once(document))
    }

    /// Upsert many documents as one batch
    pub fn bulk_upsert<I>(&mut self, documents: I) -> UpsertSummary
    where
        I: IntoIterator<Item = Document>,
    {
        self.upsert(documents, true)
    }

    /// Load documents from local persistence; no storage ops are produced
    pub fn hydrate<I>(&mut self, documents: I) -> UpsertSummary
    where
        I: IntoIterator<Item = Document>,
    {
        self.upsert(documents, false)
    }

    fn upsert<I>(&mut self, documents: I, persist: bool) -> UpsertSummary
    where
        I: IntoIterator<Item = Document>,
    {
        let mut summary = UpsertSummary::default();
        let mut added: Vec<Document> = Vec::new();
        let mut updated: Vec<Document> = Vec::new();
        let mut evicted: Vec<String> = Vec::new();

        for document in documents {
            let id = document.id().to_string();
            if let Some(existing) = self.documents.get(&id) {
                if document.version() < existing.version() {
                    tracing::debug!(
                        collection = %self.definition.name,
                        id = %id,
                        incoming = document.version(),
                        stored = existing.version(),
                        "Dropping stale document"
                    );
                    summary.stale += 1;
                    continue;
                }
            }

            // The server owns uniqueness; a conflict means the owner's own
            // update is still in flight.
            for (field, owner) in self.unique_conflicts(&document) {
                let Some(previous) = self.documents.remove(&owner) else {
                    continue;
                };
                tracing::warn!(
                    collection = %self.definition.name,
                    id = %id,
                    field = %field,
                    owner = %owner,
                    "Evicting previous owner of unique value"
                );
                self.unindex(&previous);
                let counted = added.len() + updated.len();
                added.retain(|d| d.id() != owner);
                updated.retain(|d| d.id() != owner);
                if added.len() + updated.len() < counted {
                    // Applied earlier in this batch; no longer there.
                    summary.added = added.len();
                    summary.updated = updated.len();
                }
                evicted.push(owner);
                summary.evicted += 1;
            }

            match self.documents.remove(&id) {
                Some(previous) => {
                    self.unindex(&previous);
                    updated.push(document.clone());
                    summary.updated += 1;
                }
                None => {
                    added.push(document.clone());
                    summary.added += 1;
                }
            }
            self.index(&document);
            self.documents.insert(id, document);
        }

        if !summary.changed() {
            return summary;
        }

        if persist && self.definition.retain && !evicted.is_empty() {
            self.storage.push(StorageOp::RemoveDocuments {
                collection: self.definition.name.clone(),
                ids: evicted.clone(),
            });
        }
        if persist && self.definition.retain {
            let mut changed = added.clone();
            changed.extend(updated.iter().cloned());
            self.storage.push(StorageOp::PutDocuments {
                collection: self.definition.name.clone(),
                documents: changed,
            });
        }

        let collection = self.definition.name.clone();
        let mut all = Vec::with_capacity(added.len() + updated.len());
        if !evicted.is_empty() {
            self.emit(StoreEventKind::Remove, collection.clone(), Vec::new(), evicted.clone());
        }
        if !added.is_empty() {
            all.extend(added.iter().cloned());
            self.emit(StoreEventKind::Add, collection.clone(), added, Vec::new());
        }
        if !updated.is_empty() {
            all.extend(updated.iter().cloned());
            self.emit(StoreEventKind::Update, collection.clone(), updated, Vec::new());
        }
        self.emit(StoreEventKind::Change, collection, all, evicted);
        summary
    }

    /// Delete documents by id. Unknown ids are ignored. Returns the number removed.
    pub fn remove<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = Vec::new();
        for id in ids {
            if let Some(document) = self.documents.remove(id.as_ref()) {
                self.unindex(&document);
                removed.push(document.id().to_string());
            }
        }
        if removed.is_empty() {
            return 0;
        }

        if self.definition.retain {
            self.storage.push(StorageOp::RemoveDocuments {
                collection: self.definition.name.clone(),
                ids: removed.clone(),
            });
        }

        let count = removed.len();
        let collection = self.definition.name.clone();
        self.emit(StoreEventKind::Remove, collection.clone(), Vec::new(), removed.clone());
        self.emit(StoreEventKind::Change, collection, Vec::new(), removed);
        count
    }

    /// Drop every document and return to `Uninitialized`.
    ///
    /// Persisted copies are cleared separately by the dispatcher.
    pub fn clear(&mut self) {
        self.phase = StorePhase::Uninitialized;
        if self.documents.is_empty() {
            return;
        }
        let removed: Vec<String> = self.documents.keys().cloned().collect();
        self.documents.clear();
        self.unique.values_mut().for_each(HashMap::clear);
        self.indices.values_mut().for_each(HashMap::clear);

        let collection = self.definition.name.clone();
        self.emit(StoreEventKind::Remove, collection.clone(), Vec::new(), removed.clone());
        self.emit(StoreEventKind::Change, collection, Vec::new(), removed);
    }

    /// Cursor over every document, ordered by id
    pub fn all(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    pub fn find(&self, query: &Value) -> Result<Cursor<'_>, SyncError> {
        Cursor::new(self).find(query)
    }

    /// Point lookup on `_id` or a unique field
    pub fn by(&self, field: &str, value: &Value) -> Option<&Document> {
        let key = scalar_key(value)?;
        if field == ID_FIELD {
            return match value {
                Value::String(id) => self.documents.get(id),
                other => self.documents.get(&other.to_string()),
            };
        }
        match self.unique.get(field) {
            Some(values) => values.get(&key).and_then(|id| self.documents.get(id)),
            None => {
                tracing::warn!(
                    collection = %self.definition.name,
                    field = %field,
                    "by() called on a field that is not unique"
                );
                None
            }
        }
    }

    /// `{id: version}` of every held document
    pub fn manifest(&self) -> BTreeMap<String, u64> {
        self.documents
            .iter()
            .map(|(id, doc)| (id.clone(), doc.version()))
            .collect()
    }

    pub fn on<F>(&mut self, kind: StoreEventKind, handler: F) -> ListenerId
    where
        F: FnMut(&StoreEvent) + Send + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Send a collection-scoped request
    pub fn request(&self, outbound: &mut Outbound, method: &str, data: Value) -> Transaction {
        outbound.send(OutboundRequest::new(self.definition.name.as_str(), method, data))
    }

    pub(crate) fn take_storage_ops(&mut self) -> Vec<StorageOp> {
        std::mem::take(&mut self.storage)
    }

    /// Documents worth scanning for `filters`, narrowed by an index when possible
    pub(crate) fn candidates(&self, filters: &[Query]) -> Vec<&Document> {
        for filter in filters {
            let Some((path, value)) = filter.equality_hint() else {
                continue;
            };
            let Some(key) = scalar_key(value) else {
                continue;
            };
            if path == ID_FIELD {
                return self.by(ID_FIELD, value).into_iter().collect();
            }
            if let Some(values) = self.indices.get(path) {
                return values
                    .get(&key)
                    .map(|ids| ids.iter().filter_map(|id| self.documents.get(id)).collect())
                    .unwrap_or_default();
            }
        }
        self.documents.values().collect()
    }

    fn emit(
        &mut self,
        kind: StoreEventKind,
        collection: String,
        documents: Vec<Document>,
        removed: Vec<String>,
    ) {
        let event = StoreEvent {
            collection,
            documents,
            removed,
        };
        self.events.emit(kind, &event);
    }

    /// `(field, owner)` for every unique value of `document` held by another id
    fn unique_conflicts(&self, document: &Document) -> Vec<(String, String)> {
        self.unique
            .iter()
            .filter_map(|(field, values)| {
                let key = document.get_path(field).and_then(scalar_key)?;
                match values.get(&key) {
                    Some(owner) if owner != document.id() => Some((field.clone(), owner.clone())),
                    _ => None,
                }
            })
            .collect()
    }

    fn index(&mut self, document: &Document) {
        let id = document.id().to_string();
        for (field, values) in self.unique.iter_mut() {
            if let Some(key) = document.get_path(field).and_then(scalar_key) {
                values.insert(key, id.clone());
            }
        }
        for (field, values) in self.indices.iter_mut() {
            for key in index_keys(document, field) {
                values.entry(key).or_default().insert(id.clone());
            }
        }
    }

    fn unindex(&mut self, document: &Document) {
        let id = document.id();
        for (field, values) in self.unique.iter_mut() {
            if let Some(key) = document.get_path(field).and_then(scalar_key) {
                if values.get(&key).is_some_and(|owner| owner == id) {
                    values.remove(&key);
                }
            }
        }
        for (field, values) in self.indices.iter_mut() {
            for key in index_keys(document, field) {
                if let Some(ids) = values.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        values.remove(&key);
                    }
                }
            }
        }
    }
}

/// Index key for a scalar; `null`, arrays and objects are not indexable
fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Some(value.to_string()),
        _ => None,
    }
}

/// Every key a document contributes for `field`, including array elements
fn index_keys(document: &Document, field: &str) -> Vec<String> {
    query::values_at(document.fields(), field)
        .into_iter()
        .flat_map(|value| match value {
            Value::Array(items) => items.iter().filter_map(scalar_key).collect::<Vec<_>>(),
            other => scalar_key(other).into_iter().collect(),
        })
        .collect()
}
