//! Server settings mirror
//!
//! The server is authoritative. Local values only change when the server
//! sends them (`settings.download` reply or a `set` message); writing a
//! setting sends a request and waits for the server to echo the change.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::client::outbound::Outbound;
use crate::client::transaction::Transaction;
use crate::shared::event::{Emitter, ListenerId};
use crate::shared::protocol::OutboundRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsEventKind {
    Change,
}

/// Keys changed by one update, with their new values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsChange {
    pub changed: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct Settings {
    values: BTreeMap<String, Value>,
    events: Emitter<SettingsEventKind, SettingsChange>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`; unknown keys log a warning
    pub fn get(&self, key: &str) -> Option<&Value> {
        let value = self.values.get(key);
        if value.is_none() {
            tracing::warn!(key = %key, "Unknown setting");
        }
        value
    }

    /// Ask the server to change a setting. Nothing changes locally until
    /// the server broadcasts the new value.
    pub fn set(&self, outbound: &mut Outbound, key: &str, value: Value) -> Transaction {
        let mut data = Map::new();
        data.insert(key.to_string(), value);
        outbound.send(OutboundRequest::new("settings", "set", Value::Object(data)))
    }

    /// Merge server-sent values. Emits `Change` with the keys whose value differed.
    pub fn update(&mut self, partial: Value) {
        let Value::Object(map) = partial else {
            tracing::warn!("Ignoring settings payload that is not an object");
            return;
        };

        let mut changed = BTreeMap::new();
        for (key, value) in map {
            if self.values.get(&key) != Some(&value) {
                self.values.insert(key.clone(), value.clone());
                changed.insert(key, value);
            }
        }

        if !changed.is_empty() {
            tracing::debug!(keys = changed.len(), "Settings updated");
            self.events
                .emit(SettingsEventKind::Change, &SettingsChange { changed });
        }
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn on<F>(&mut self, kind: SettingsEventKind, handler: F) -> ListenerId
    where
        F: FnMut(&SettingsChange) + Send + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.events.off(id)
    }
}
