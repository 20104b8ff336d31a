//! Session actor end-to-end tests

use pretty_assertions::assert_eq;
use serde_json::json;
use virtool_sync::client::StorePhase;
use virtool_sync::shared::{SyncError, TransactionError};

use crate::common::{add, eventually, spawn_session, FakeServer};
use crate::{assert_err, assert_ok};

#[tokio::test]
async fn test_initial_sync_populates_stores() {
    let mut session = spawn_session(None);
    let mut server = FakeServer::accept(&mut session.accepted).await;
    assert!(server.cookie().is_none());

    let manifest = server
        .complete_handshake(
            json!({"sample_group": "force_choice"}),
            vec![
                add("jobs", json!([{"_id": "j1", "state": "running"}, {"_id": "j2", "state": "complete"}])),
                add("viruses", json!({"_id": "v1", "name": "Tobacco mosaic virus", "_version": 2})),
                add("users", json!({"_id": "bob"})),
            ],
        )
        .await;
    assert_eq!(manifest, json!({"jobs": {}, "viruses": {}}));

    assert_ok!(session.handle.wait_synced().await);
    let (jobs, viruses, phase, setting) = assert_ok!(
        session
            .handle
            .call(|d| {
                (
                    d.store("jobs").map(|s| s.len()),
                    d.store("viruses").map(|s| s.len()),
                    d.store("jobs").map(|s| s.phase()),
                    d.settings().get("sample_group").cloned(),
                )
            })
            .await
    );
    assert_eq!(jobs, Some(2));
    assert_eq!(viruses, Some(1));
    assert_eq!(phase, Some(StorePhase::Synced));
    assert_eq!(setting, Some(json!("force_choice")));

    session.handle.shutdown();
    assert_ok!(session.task.await);
}

#[tokio::test]
async fn test_request_round_trip_through_handle() {
    let mut session = spawn_session(None);
    let mut server = FakeServer::accept(&mut session.accepted).await;
    server.complete_handshake(json!({}), Vec::new()).await;

    let outcome = assert_ok!(
        session
            .handle
            .call(|d| d.request("jobs", "cancel", json!({"_id": "j1"})).outcome())
            .await
    );
    let request = server.expect("jobs", "cancel").await;
    assert_eq!(request["data"], json!({"_id": "j1"}));
    server.reply(&request, true, json!({"_id": "j1", "state": "cancelled"})).await;

    assert_eq!(
        assert_ok!(outcome.await),
        Ok(json!({"_id": "j1", "state": "cancelled"}))
    );
}

#[tokio::test]
async fn test_disconnect_fails_pending_and_reconnects() {
    let mut session = spawn_session(None);
    let mut server = FakeServer::accept(&mut session.accepted).await;
    server
        .complete_handshake(json!({}), vec![add("jobs", json!({"_id": "j1", "_version": 4}))])
        .await;
    assert_ok!(session.handle.wait_synced().await);
    assert_ok!(session.handle.call(|d| d.listen("status")).await);
    server.expect("dispatcher", "listen").await;

    let outcome = assert_ok!(
        session
            .handle
            .call(|d| d.request("jobs", "archive", json!({"_id": "j1"})).outcome())
            .await
    );
    server.expect("jobs", "archive").await;
    drop(server);

    assert_eq!(assert_ok!(outcome.await), Err(TransactionError::Disconnected));

    let mut server = FakeServer::accept(&mut session.accepted).await;
    let listen = server.expect("dispatcher", "listen").await;
    assert_eq!(listen["data"], json!({"name": "status"}));
    let manifest = server.complete_handshake(json!({}), Vec::new()).await;
    assert_eq!(manifest["jobs"], json!({"j1": 4}));
    assert_ok!(session.handle.wait_synced().await);
}

#[tokio::test]
async fn test_refused_sync_reconnects_and_recovers() {
    let mut session = spawn_session(None);
    let mut server = FakeServer::accept(&mut session.accepted).await;
    let download = server.expect("settings", "download").await;
    server.reply(&download, true, json!({})).await;
    let sync = server.expect("dispatcher", "sync").await;
    server.reply(&sync, false, json!({"message": "busy"})).await;

    let mut server = FakeServer::accept(&mut session.accepted).await;
    server
        .complete_handshake(json!({}), vec![add("jobs", json!({"_id": "j1"}))])
        .await;

    assert_ok!(session.handle.wait_synced().await);
    let jobs = assert_ok!(session.handle.call(|d| d.store("jobs").map(|s| s.len())).await);
    assert_eq!(jobs, Some(1));
}

#[tokio::test]
async fn test_deauthorize_resets_client() {
    let mut session = spawn_session(None);
    let mut server = FakeServer::accept(&mut session.accepted).await;
    server
        .complete_handshake(json!({}), vec![add("jobs", json!({"_id": "j1"}))])
        .await;
    assert_ok!(session.handle.wait_synced().await);

    server.push(json!({"operation": "amend", "data": {"_id": "bob", "token": "t1"}})).await;
    server.push(json!({"operation": "deauthorize", "data": {"reason": "expired"}})).await;
    eventually(&session.handle, |d| d.sync_progress().generation > 1 && !d.is_synced()).await;

    let (authenticated, jobs) = assert_ok!(
        session
            .handle
            .call(|d| (d.user().is_authenticated(), d.store("jobs").map(|s| s.len())))
            .await
    );
    assert!(!authenticated);
    assert_eq!(jobs, Some(0));
}

#[tokio::test]
async fn test_shutdown_closes_handle() {
    let session = spawn_session(None);
    let handle = session.handle.clone();
    handle.shutdown();
    assert_ok!(session.task.await);
    assert_err!(handle.call(|d| d.is_connected()).await, SyncError::SessionClosed);
}
