//! Document
//!
//! A document is an arbitrary JSON object belonging to one collection. Two
//! fields carry meaning for synchronization: the identifier `_id` and the
//! version `_version`. Everything else is opaque to the core.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::shared::error::SyncError;

/// Name of the collection-scoped identifier field
pub const ID_FIELD: &str = "_id";

/// Name of the monotonically increasing version field
pub const VERSION_FIELD: &str = "_version";

/// A JSON object with a string `_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Document {
    id: String,
    fields: Map<String, Value>,
}

impl Document {
    /// Build a document from a JSON value.
    ///
    /// Fails when the value is not an object or lacks a string `_id`.
    pub fn from_value(value: Value) -> Result<Self, SyncError> {
        let Value::Object(fields) = value else {
            return Err(SyncError::protocol("document is not a JSON object"));
        };
        let id = match fields.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(SyncError::protocol("document has no string _id")),
        };
        Ok(Self { id, fields })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Version of this document; missing or non-numeric versions count as 0
    pub fn version(&self) -> u64 {
        self.fields
            .get(VERSION_FIELD)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Top-level field lookup
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Dotted-path lookup (`"user.id"`), descending through objects and
    /// numeric array indices
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl TryFrom<Value> for Document {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc.fields)
    }
}

/// Split a `data` payload that may be a single document or an array of them.
///
/// Entries that are not valid documents are logged and skipped.
pub fn documents_from_value(value: Value) -> Vec<Document> {
    let items = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match Document::from_value(item) {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::warn!("Skipping invalid document: {}", e);
                None
            }
        })
        .collect()
}

/// Extract identifiers from a `remove` payload.
///
/// Accepts a bare id, an array of ids, documents carrying `_id`, or an
/// object of the form `{"_id": [...]}`.
pub fn ids_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::String(id) => vec![id.clone()],
        Value::Number(n) => vec![n.to_string()],
        Value::Array(items) => items.iter().flat_map(ids_from_value).collect(),
        Value::Object(map) => map.get(ID_FIELD).map(ids_from_value).unwrap_or_default(),
        _ => Vec::new(),
    }
}
