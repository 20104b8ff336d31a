//! Scripted server for integration tests
//!
//! Wraps the server end of an in-memory connection with helpers that read
//! the client's requests and answer them.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use virtool_sync::client::connection::ServerEnd;
use virtool_sync::client::user::SessionCookie;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FakeServer {
    end: ServerEnd,
}

impl FakeServer {
    /// Wait for the client's next connection attempt
    pub async fn accept(accepted: &mut UnboundedReceiver<ServerEnd>) -> Self {
        let end = tokio::time::timeout(STEP_TIMEOUT, accepted.recv())
            .await
            .expect("client did not connect in time")
            .expect("connector dropped");
        Self { end }
    }

    pub fn cookie(&self) -> Option<&SessionCookie> {
        self.end.cookie.as_ref()
    }

    /// Next request from the client
    pub async fn next_request(&mut self) -> Value {
        let frame = tokio::time::timeout(STEP_TIMEOUT, self.end.recv())
            .await
            .expect("client sent nothing in time")
            .expect("client closed the connection");
        serde_json::from_str(&frame).expect("client frames are JSON")
    }

    /// Read requests until one matches `collection`/`method`
    pub async fn expect(&mut self, collection: &str, method: &str) -> Value {
        loop {
            let request = self.next_request().await;
            if request["collectionName"] == collection && request["methodName"] == method {
                return request;
            }
        }
    }

    pub async fn reply(&self, request: &Value, success: bool, data: Value) {
        self.push(json!({
            "operation": "transaction",
            "data": {"tid": request["tid"], "success": success, "data": data}
        }))
        .await;
    }

    pub async fn push(&self, message: Value) {
        assert!(self.end.send(message.to_string()).await, "client is gone");
    }

    /// Answer the sync handshake with `operations` catch-up messages.
    /// Returns the manifest the client sent.
    pub async fn complete_handshake(&mut self, settings: Value, operations: Vec<Value>) -> Value {
        let download = self.expect("settings", "download").await;
        self.reply(&download, true, settings).await;

        let sync = self.expect("dispatcher", "sync").await;
        self.reply(&sync, true, json!(operations.len())).await;
        for mut operation in operations {
            operation["sync"] = json!(true);
            self.push(operation).await;
        }
        sync["data"].clone()
    }
}

/// An `add` message for `collection`
pub fn add(collection: &str, documents: Value) -> Value {
    json!({"operation": "add", "collection_name": collection, "data": documents})
}
