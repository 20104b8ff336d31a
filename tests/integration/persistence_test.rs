//! Local database tests through a running session

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;
use virtool_sync::client::local_db::LocalDatabase;

use crate::assert_ok;
use crate::common::{add, eventually, spawn_session, FakeServer};

async fn stop(session: crate::common::TestSession) {
    session.handle.shutdown();
    assert_ok!(session.task.await);
}

#[tokio::test]
async fn test_synced_documents_are_persisted() {
    let db = assert_ok!(LocalDatabase::in_memory().await);
    let mut session = spawn_session(Some(db.clone()));
    let mut server = FakeServer::accept(&mut session.accepted).await;
    server
        .complete_handshake(
            json!({}),
            vec![
                add("jobs", json!([{"_id": "j1", "_version": 1}, {"_id": "j2", "_version": 3}])),
                add("users", json!({"_id": "bob"})),
            ],
        )
        .await;
    assert_ok!(session.handle.wait_synced().await);

    server
        .push(json!({"operation": "remove", "collection_name": "jobs", "data": ["j1"]}))
        .await;
    eventually(&session.handle, |d| {
        d.store("jobs")
            .is_some_and(|jobs| jobs.get("j2").is_some() && jobs.get("j1").is_none())
    }).await;
    stop(session).await;

    let jobs = assert_ok!(db.load_collection("jobs").await);
    let ids: Vec<&str> = jobs.iter().map(|doc| doc.id()).collect();
    assert_eq!(ids, vec!["j2"]);
    // Not retained, so never written.
    assert!(assert_ok!(db.load_collection("users").await).is_empty());
}

#[tokio::test]
async fn test_hydrated_session_sends_manifest() {
    let db = assert_ok!(LocalDatabase::in_memory().await);

    let mut first = spawn_session(Some(db.clone()));
    let mut server = FakeServer::accept(&mut first.accepted).await;
    server
        .complete_handshake(
            json!({}),
            vec![
                add("jobs", json!({"_id": "j1", "_version": 5, "state": "running"})),
                add("viruses", json!({"_id": "v1", "_version": 2, "name": "PVY"})),
            ],
        )
        .await;
    assert_ok!(first.handle.wait_synced().await);
    stop(first).await;

    let mut second = spawn_session(Some(db.clone()));
    let running = assert_ok!(
        second
            .handle
            .call(|d| {
                d.store("jobs")
                    .and_then(|jobs| jobs.find(&json!({"state": "running"})).ok().map(|c| c.count()))
            })
            .await
    );
    assert_eq!(running, Some(1));

    let mut server = FakeServer::accept(&mut second.accepted).await;
    let manifest = server.complete_handshake(json!({}), Vec::new()).await;
    assert_eq!(manifest, json!({"jobs": {"j1": 5}, "viruses": {"v1": 2}}));
    stop(second).await;
}

#[tokio::test]
async fn test_session_cookie_is_presented_on_next_connection() {
    let db = assert_ok!(LocalDatabase::in_memory().await);

    let mut first = spawn_session(Some(db.clone()));
    let mut server = FakeServer::accept(&mut first.accepted).await;
    server.complete_handshake(json!({}), Vec::new()).await;
    server
        .push(json!({"operation": "amend", "data": {"_id": "bob", "token": "abc123"}}))
        .await;
    eventually(&first.handle, |d| d.user().name() == Some("bob")).await;
    stop(first).await;

    let cookie = assert_ok!(db.load_cookie(Utc::now()).await);
    assert_eq!(cookie.map(|c| c.token), Some("abc123".to_string()));

    let mut second = spawn_session(Some(db.clone()));
    let server = FakeServer::accept(&mut second.accepted).await;
    assert_eq!(server.cookie().map(|c| c.token.as_str()), Some("abc123"));
    stop(second).await;
}

#[tokio::test]
async fn test_deauthorize_clears_disk() {
    let db = assert_ok!(LocalDatabase::in_memory().await);
    let mut session = spawn_session(Some(db.clone()));
    let mut server = FakeServer::accept(&mut session.accepted).await;
    server
        .complete_handshake(json!({}), vec![add("jobs", json!({"_id": "j1"}))])
        .await;
    server
        .push(json!({"operation": "amend", "data": {"_id": "bob", "token": "abc123"}}))
        .await;
    server
        .push(json!({"operation": "deauthorize", "data": {"reason": "expired"}}))
        .await;
    eventually(&session.handle, |d| d.sync_progress().generation > 1).await;
    stop(session).await;

    assert!(assert_ok!(db.load_collection("jobs").await).is_empty());
    assert_eq!(assert_ok!(db.load_cookie(Utc::now()).await), None);
}
