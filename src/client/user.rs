//! Authenticated user
//!
//! The session payload sent by the server (on login and in `amend`
//! messages) is merged into [`User`]. Its `_id` becomes the user's name;
//! `token`, `permissions`, `groups` and `settings` have typed homes and
//! everything else is kept as extra fields.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::client::outbound::Outbound;
use crate::client::transaction::Transaction;
use crate::shared::document::ID_FIELD;
use crate::shared::event::{Emitter, ListenerId};
use crate::shared::protocol::OutboundRequest;

/// Lifetime of a persisted session token
pub const SESSION_TTL_DAYS: i64 = 7;

/// Persisted session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionCookie {
    pub fn new(token: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at: now + Duration::days(SESSION_TTL_DAYS),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Value of the `Cookie` header sent on the WebSocket upgrade
    pub fn header_value(&self) -> String {
        format!("token={}", self.token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEventKind {
    Change,
    Logout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Change { name: Option<String> },
    Logout { reason: Value },
}

#[derive(Debug, Default)]
pub struct User {
    name: Option<String>,
    token: Option<String>,
    permissions: BTreeMap<String, bool>,
    groups: Vec<String>,
    settings: Map<String, Value>,
    extra: Map<String, Value>,
    events: Emitter<UserEventKind, UserEvent>,
}

impl User {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a session payload. Returns the cookie to persist when the
    /// payload carries a token.
    pub fn load(&mut self, payload: Value, now: DateTime<Utc>) -> Option<SessionCookie> {
        let Value::Object(fields) = payload else {
            tracing::warn!("Ignoring session payload that is not an object");
            return None;
        };

        let mut cookie = None;
        for (key, value) in fields {
            match key.as_str() {
                ID_FIELD => match value {
                    Value::String(name) => self.name = Some(name),
                    other => self.name = Some(other.to_string()),
                },
                "token" => {
                    if let Value::String(token) = value {
                        cookie = Some(SessionCookie::new(token.as_str(), now));
                        self.token = Some(token);
                    }
                }
                "permissions" => {
                    if let Value::Object(permissions) = value {
                        self.permissions = permissions
                            .into_iter()
                            .map(|(name, granted)| (name, granted.as_bool().unwrap_or(false)))
                            .collect();
                    }
                }
                "groups" => {
                    if let Value::Array(groups) = value {
                        self.groups = groups
                            .into_iter()
                            .filter_map(|g| g.as_str().map(str::to_string))
                            .collect();
                    }
                }
                "settings" => {
                    if let Value::Object(settings) = value {
                        self.settings.extend(settings);
                    }
                }
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }

        tracing::debug!(name = ?self.name, "Loaded session payload");
        self.events.emit(
            UserEventKind::Change,
            &UserEvent::Change {
                name: self.name.clone(),
            },
        );
        cookie
    }

    /// Forget everything about the session and emit `Logout`
    pub(crate) fn reset(&mut self, reason: Value) {
        self.name = None;
        self.token = None;
        self.permissions.clear();
        self.groups.clear();
        self.settings.clear();
        self.extra.clear();
        self.events.emit(UserEventKind::Logout, &UserEvent::Logout { reason });
    }

    /// Ask the server to end the session
    pub fn logout(&self, outbound: &mut Outbound) -> Transaction {
        let data = json!({ "token": self.token });
        outbound.send(OutboundRequest::new("users", "logout", data))
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.name.is_some()
    }

    pub fn is_administrator(&self) -> bool {
        self.extra
            .get("administrator")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Administrators hold every permission
    pub fn can(&self, permission: &str) -> bool {
        self.is_administrator() || self.permissions.get(permission).copied().unwrap_or(false)
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.extra.get(field)
    }

    pub fn on<F>(&mut self, kind: UserEventKind, handler: F) -> ListenerId
    where
        F: FnMut(&UserEvent) + Send + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.events.off(id)
    }
}
