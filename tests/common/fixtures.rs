//! Document, configuration and session fixtures

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use virtool_sync::client::connection::{Backoff, MemoryConnector, ServerEnd};
use virtool_sync::client::local_db::LocalDatabase;
use virtool_sync::client::session::{self, SessionHandle};
use virtool_sync::client::{CollectionDefinition, Dispatcher};
use virtool_sync::shared::{AppConfig, Document};

/// Build a document, panicking on invalid input
pub fn doc(value: Value) -> Document {
    Document::from_value(value).expect("fixture document must have an _id")
}

pub fn test_config() -> AppConfig {
    AppConfig::builder()
        .server_id("test")
        .request_timeout(Duration::from_secs(5))
        .backoff(Duration::from_millis(10), Duration::from_millis(50))
        .build()
        .expect("test config is valid")
}

/// Two retained collections and one that is refetched every connection
pub fn test_definitions() -> Vec<CollectionDefinition> {
    vec![
        CollectionDefinition::new("jobs").indexed(&["state"]).retained(true),
        CollectionDefinition::new("viruses").unique(&["name"]).retained(true),
        CollectionDefinition::new("users"),
    ]
}

pub fn test_dispatcher() -> Dispatcher {
    Dispatcher::with_definitions(test_config(), test_definitions())
}

pub fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(50)).with_seed(1)
}

/// A running session over the in-memory transport
pub struct TestSession {
    pub handle: SessionHandle,
    pub task: JoinHandle<()>,
    pub accepted: UnboundedReceiver<ServerEnd>,
}

pub fn spawn_session(database: Option<LocalDatabase>) -> TestSession {
    let (connector, accepted) = MemoryConnector::new();
    let (handle, task) = session::spawn(test_dispatcher(), connector, database, fast_backoff());
    TestSession {
        handle,
        task,
        accepted,
    }
}

/// Poll the dispatcher until `check` holds. Frames and commands reach the
/// actor on different channels, so a pushed frame is not guaranteed to be
/// handled before the next `call`.
pub async fn eventually<F>(handle: &SessionHandle, check: F)
where
    F: Fn(&Dispatcher) -> bool + Clone + Send + 'static,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let check = check.clone();
        if handle.call(move |d| check(d)).await.expect("session is running") {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
