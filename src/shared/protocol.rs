//! Wire Protocol
//!
//! JSON frames exchanged over the session WebSocket.
//!
//! # Outbound
//!
//! Every request the client makes has the same shape:
//!
//! ```json
//! { "methodName": "remove_job", "collectionName": "jobs", "data": {"_id": ["x"]}, "tid": 42 }
//! ```
//!
//! # Inbound
//!
//! Server frames are discriminated by `operation`. They are first decoded
//! into the permissive [`RawInbound`] shape and then converted into the
//! closed [`Inbound`] enum, so unknown operations survive decoding and can be
//! logged rather than rejected.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::shared::document::{documents_from_value, ids_from_value, Document};
use crate::shared::error::SyncError;

/// Correlation id attached to outbound requests
pub type Tid = u32;

/// A request written to the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    pub method_name: String,
    pub collection_name: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<Tid>,
}

impl OutboundRequest {
    pub fn new(collection: impl Into<String>, method: impl Into<String>, data: Value) -> Self {
        Self {
            method_name: method.into(),
            collection_name: collection.into(),
            data,
            tid: None,
        }
    }
}

/// Permissive decoding target for server frames
#[derive(Debug, Clone, Deserialize)]
pub struct RawInbound {
    pub operation: String,
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub sync: bool,
}

/// Which store mutation a collection message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Add,
    Update,
    Remove,
}

/// Payload of a collection mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MutationData {
    Documents(Vec<Document>),
    Ids(Vec<String>),
}

/// Reply to a correlated request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransactionReply {
    pub tid: Tid,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
}

/// A decoded server frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Collection {
        mutation: Mutation,
        collection: String,
        data: MutationData,
        sync: bool,
    },
    Transaction(TransactionReply),
    Ping,
    Set(Value),
    Amend(Value),
    Deauthorize(Value),
    Unknown { operation: String },
}

impl Inbound {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let raw: RawInbound = serde_json::from_str(text)
            .map_err(|e| SyncError::protocol(format!("malformed frame: {}", e)))?;
        Self::try_from(raw)
    }
}

impl TryFrom<RawInbound> for Inbound {
    type Error = SyncError;

    fn try_from(raw: RawInbound) -> Result<Self, Self::Error> {
        let mutation = match raw.operation.as_str() {
            "add" => Some(Mutation::Add),
            "update" => Some(Mutation::Update),
            "remove" => Some(Mutation::Remove),
            _ => None,
        };

        if let Some(mutation) = mutation {
            let collection = raw.collection_name.ok_or_else(|| {
                SyncError::protocol(format!("{} message without collection_name", raw.operation))
            })?;
            let data = match mutation {
                Mutation::Remove => MutationData::Ids(ids_from_value(&raw.data)),
                Mutation::Add | Mutation::Update => {
                    MutationData::Documents(documents_from_value(raw.data))
                }
            };
            return Ok(Inbound::Collection {
                mutation,
                collection,
                data,
                sync: raw.sync,
            });
        }

        Ok(match raw.operation.as_str() {
            "transaction" => Inbound::Transaction(
                serde_json::from_value(raw.data)
                    .map_err(|e| SyncError::protocol(format!("bad transaction reply: {}", e)))?,
            ),
            "ping" => Inbound::Ping,
            "set" => Inbound::Set(raw.data),
            "amend" => Inbound::Amend(raw.data),
            "deauthorize" => Inbound::Deauthorize(raw.data),
            _ => Inbound::Unknown {
                operation: raw.operation,
            },
        })
    }
}
