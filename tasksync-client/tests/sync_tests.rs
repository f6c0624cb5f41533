mod common;

use common::{
    eventually, make_task, record_events, setup_client, setup_client_with, setup_test_db,
    test_config,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tasksync_client::{
    remote::RemoteStoreClient, session::SessionAuthenticator, EventDispatcher, InMemoryTransport,
    RemoteOutcome, SyncEvent, SyncState,
};
use tasksync_core::{
    errors::RemoteError,
    models::{TaskStatus, TodoRecord},
    SyncError,
};

#[tokio::test]
async fn test_fetch_reflects_crud_sequence() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport).await;

    let a = client.add(make_task("Buy milk", 1)).await.unwrap();
    let b = client.add(make_task("Walk dog", 2)).await.unwrap();
    let mut a_edit = a.clone();
    a_edit.title = "Buy oat milk".to_string();
    a_edit.status = TaskStatus::InProgress;
    client.update(a_edit).await.unwrap();
    client.delete(b.id).await.unwrap();
    let c = client.add(make_task("File taxes", 5)).await.unwrap();

    // Visible immediately, without waiting for the network.
    let items = client.fetch().await.unwrap();
    let ids: HashSet<_> = items.iter().map(|t| t.id).collect();
    assert_eq!(ids, HashSet::from([a.id, c.id]));

    let a_now = items.iter().find(|t| t.id == a.id).unwrap();
    assert_eq!(a_now.title, "Buy oat milk");
    assert_eq!(a_now.status, TaskStatus::InProgress);
    assert!(a_now.updated_at >= a_now.created_at);

    client.wait_for_background().await;
    assert_eq!(client.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_add_stamps_owner_from_session() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;
    assert!(client.session().ensure_authenticated().await);

    let mut task = make_task("Forged owner", 0);
    task.owner_identity = "someone-else".to_string();
    let stored = client.add(task).await.unwrap();
    assert_eq!(stored.owner_identity, "user-x");

    client.wait_for_background().await;
    let remote = transport.record(&stored.id).unwrap();
    assert_eq!(remote.owner_identity, "user-x");
    assert_eq!(remote.title, "Forged owner");
}

#[tokio::test]
async fn test_empty_sync_makes_no_remote_call() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;

    assert_eq!(client.perform_sync().await.unwrap(), 0);
    assert_eq!(transport.auth_calls(), 0);
    assert_eq!(transport.request_calls(), 0);
    assert_eq!(client.last_sync_time().await.unwrap(), None);
}

#[tokio::test]
async fn test_remote_disabled_stays_local_only() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    transport.set_auth_failure(Some(RemoteError::NetworkUnavailable("offline".into())));
    let client = setup_client(transport.clone()).await;

    let a = client.add(make_task("Buy milk", 1)).await.unwrap();

    let items = client.fetch().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Buy milk");
    assert_eq!(items[0].priority, 1);
    let status = client.database().get_sync_status(&a.id).await.unwrap().unwrap();
    assert!(!status.synced);

    client.wait_for_background().await;
    assert_eq!(client.perform_sync().await.unwrap(), 0);
    assert!(client.session().is_remote_disabled());
    assert_eq!(client.count_pending().await.unwrap(), 1);
    assert_eq!(transport.request_calls(), 0);
    assert!(client.last_sync_time().await.unwrap().is_some());
}

#[tokio::test]
async fn test_partial_failure_reports_synced_count() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    transport.fail_requests_with(Some(RemoteError::NetworkUnavailable("flaky".into())));
    let client = setup_client(transport.clone()).await;
    let seen = record_events(&client.events());

    let a = client.add(make_task("a", 0)).await.unwrap();
    let b = client.add(make_task("b", 0)).await.unwrap();
    let c = client.add(make_task("c", 0)).await.unwrap();
    client.wait_for_background().await;

    let status = client.database().get_sync_status(&b.id).await.unwrap().unwrap();
    assert!(!status.synced);
    assert!(status.last_error.unwrap().contains("flaky"));

    transport.fail_requests_with(None);
    transport.fail_record(b.id, RemoteError::QuotaExceeded);

    let err = client.perform_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::PartialSync { synced: 2, failed: 1 }));
    assert_eq!(err.synced_count(), Some(2));

    // Only the failed item is left for the next pass.
    assert_eq!(client.database().get_unsynced_ids().await.unwrap(), vec![b.id]);
    assert!(transport.record(&a.id).is_some());
    assert!(transport.record(&c.id).is_some());

    transport.clear_record_failure(&b.id);
    assert_eq!(client.perform_sync().await.unwrap(), 1);
    assert_eq!(client.count_pending().await.unwrap(), 0);

    let states: Vec<SyncState> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            SyncEvent::SyncStatusChanged(state) => Some(state.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(states.len(), 4);
    assert_eq!(states[0], SyncState::Syncing);
    assert!(matches!(states[1], SyncState::Failed(_)));
    assert_eq!(states[3], SyncState::Completed(1));
}

#[tokio::test]
async fn test_local_writes_never_fail_on_remote_errors() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    transport.fail_requests_with(Some(RemoteError::Unknown("internal".into())));
    let client = setup_client(transport.clone()).await;

    let task = client.add(make_task("Still saved", 0)).await.unwrap();
    let mut edit = task.clone();
    edit.pinned = true;
    client.update(edit).await.unwrap();
    client.wait_for_background().await;

    let stored = client.database().get_task(&task.id).await.unwrap().unwrap();
    assert!(stored.pinned);
    assert_eq!(client.count_pending().await.unwrap(), 1);

    client.delete(task.id).await.unwrap();
    client.wait_for_background().await;
    assert!(client.fetch().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expired_session_is_refreshed_transparently() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;

    client.add(make_task("first", 0)).await.unwrap();
    client.wait_for_background().await;
    assert_eq!(transport.auth_calls(), 1);

    transport.expire_session();
    let second = client.add(make_task("second", 0)).await.unwrap();
    client.wait_for_background().await;

    assert_eq!(transport.auth_calls(), 2);
    assert!(transport.record(&second.id).is_some());
    assert_eq!(client.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_conflict_is_retried_after_refetch() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;

    let task = client.add(make_task("Contended", 0)).await.unwrap();
    client.wait_for_background().await;

    transport.fail_next_request(RemoteError::RecordConflict(task.id));
    let mut edit = task.clone();
    edit.title = "Contended, edited".to_string();
    client.update(edit).await.unwrap();
    client.wait_for_background().await;

    assert_eq!(transport.record(&task.id).unwrap().title, "Contended, edited");
    assert_eq!(client.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_update_announces_refresh_before_push() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;

    let task = client.add(make_task("Before", 0)).await.unwrap();
    client.wait_for_background().await;

    transport.set_request_delay(Duration::from_millis(300));
    let seen = record_events(&client.events());
    let mut edit = task.clone();
    edit.title = "After".to_string();
    client.update(edit).await.unwrap();

    // Announced on the local write while the push is still in flight.
    assert_eq!(*seen.lock().unwrap(), vec![SyncEvent::DataRefreshed]);
    assert_eq!(transport.record(&task.id).unwrap().title, "Before");
    assert_eq!(client.count_pending().await.unwrap(), 1);

    client.wait_for_background().await;
    assert_eq!(transport.record(&task.id).unwrap().title, "After");
    assert_eq!(client.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rapid_updates_end_synced() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;

    let task = client.add(make_task("draft", 0)).await.unwrap();
    client.wait_for_background().await;

    let mut first = task.clone();
    first.title = "one".to_string();
    client.update(first).await.unwrap();
    let mut second = task.clone();
    second.title = "two".to_string();
    client.update(second).await.unwrap();

    client.wait_for_background().await;

    let local = client.database().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(local.title, "two");
    let status = client.database().get_sync_status(&task.id).await.unwrap().unwrap();
    assert!(status.synced);

    let remote_title = transport.record(&task.id).unwrap().title;
    assert!(remote_title == "one" || remote_title == "two");
}

#[tokio::test]
async fn test_remote_update_of_deleted_record_keeps_local_copy() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let db = Arc::new(setup_test_db().await);
    let events = Arc::new(EventDispatcher::new());
    let config = test_config();
    let session = SessionAuthenticator::new(transport.clone(), db, events, &config)
        .await
        .unwrap();
    let remote = RemoteStoreClient::new(transport.clone(), session, config.request_timeout);

    let task = make_task("Gone remotely", 2);
    let outcome = remote.update("user-x", &task).await;

    assert_eq!(outcome, RemoteOutcome::Applied(task.clone()));
    assert_eq!(transport.record_count(), 0);

    // Deleting what is already gone is fine too.
    assert_eq!(remote.delete("user-x", task.id).await, RemoteOutcome::Applied(()));
}

#[tokio::test]
async fn test_fetch_all_is_scoped_to_session_identity() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let db = Arc::new(setup_test_db().await);
    let config = test_config();
    let session = SessionAuthenticator::new(
        transport.clone(),
        db,
        Arc::new(EventDispatcher::new()),
        &config,
    )
    .await
    .unwrap();
    let remote = RemoteStoreClient::new(transport.clone(), session, config.request_timeout);

    let mut mine = make_task("mine", 0);
    mine.owner_identity = "user-x".to_string();
    transport.insert_record(TodoRecord::from_item(&mine));
    let mut theirs = make_task("theirs", 0);
    theirs.owner_identity = "user-y".to_string();
    transport.insert_record(TodoRecord::from_item(&theirs));

    let items = remote.fetch_all("user-x").await.applied().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, mine.id);

    assert_eq!(remote.fetch_all("user-y").await, RemoteOutcome::Skipped);

    // Nothing is written into an account the session is not signed in as.
    let requests = transport.request_calls();
    assert_eq!(remote.save("user-y", &theirs).await, RemoteOutcome::Skipped);
    assert_eq!(transport.request_calls(), requests);
}

#[tokio::test]
async fn test_hung_remote_call_times_out() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let mut config = test_config();
    config.request_timeout = Duration::from_millis(100);
    let client = setup_client_with(config, transport.clone()).await;
    assert!(client.session().ensure_authenticated().await);

    transport.set_request_delay(Duration::from_secs(30));
    let task = client.add(make_task("Slow", 0)).await.unwrap();

    let started = std::time::Instant::now();
    let err = client.perform_sync().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(err, SyncError::PartialSync { synced: 0, failed: 1 }));

    let status = client.database().get_sync_status(&task.id).await.unwrap().unwrap();
    assert!(status.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_pull_reconciles_remote_state() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;

    let removed_elsewhere = client.add(make_task("deleted on other device", 0)).await.unwrap();
    client.wait_for_background().await;
    transport.remove_record(&removed_elsewhere.id);

    let unpushed = make_task("not pushed yet", 0);
    transport.fail_record(unpushed.id, RemoteError::NetworkUnavailable("offline".into()));
    let unpushed = client.add(unpushed).await.unwrap();
    client.wait_for_background().await;

    let mut from_other_device = make_task("from other device", 4);
    from_other_device.owner_identity = "user-x".to_string();
    transport.insert_record(TodoRecord::from_item(&from_other_device));

    let changes = client.coordinator().pull_remote().await.unwrap();
    assert_eq!(changes, 2);

    let ids: HashSet<_> = client
        .database()
        .get_all_tasks()
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, HashSet::from([unpushed.id, from_other_device.id]));

    // Nothing new the second time round.
    assert_eq!(client.coordinator().pull_remote().await.unwrap(), 0);
}

#[tokio::test]
async fn test_fetch_refreshes_only_when_reconciliation_changes_data() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;
    client.add(make_task("local", 0)).await.unwrap();
    client.wait_for_background().await;

    let seen = record_events(&client.events());
    assert_eq!(client.fetch().await.unwrap().len(), 1);
    client.wait_for_background().await;
    assert!(!seen.lock().unwrap().contains(&SyncEvent::DataRefreshed));

    let mut remote_task = make_task("remote", 0);
    remote_task.owner_identity = "user-x".to_string();
    transport.insert_record(TodoRecord::from_item(&remote_task));

    assert_eq!(client.fetch().await.unwrap().len(), 1);
    client.wait_for_background().await;
    assert!(seen.lock().unwrap().contains(&SyncEvent::DataRefreshed));
    assert_eq!(client.database().get_all_tasks().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_identity_switch_never_shows_previous_data() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;
    let seen = record_events(&client.events());

    client.add(make_task("x's task", 0)).await.unwrap();
    client.wait_for_background().await;

    let mut y_task = make_task("y's task", 0);
    y_task.owner_identity = "user-y".to_string();
    transport.insert_record(TodoRecord::from_item(&y_task));

    // Hold back the new identity's pull so the cleared store is observable.
    transport.set_request_delay(Duration::from_millis(300));
    transport.set_account(Some("user-y"));
    transport.expire_session();
    client.fetch().await.unwrap();

    let switched = eventually(|| async {
        seen.lock()
            .unwrap()
            .contains(&SyncEvent::AccountChanged {
                identity: "user-y".to_string(),
            })
    })
    .await;
    assert!(switched);

    let db = client.database().clone();
    let cleared = eventually(|| {
        let db = db.clone();
        async move { db.get_all_tasks().await.unwrap().is_empty() }
    })
    .await;
    assert!(cleared);
    assert!(client.fetch().await.unwrap().is_empty());
    assert!(transport.record(&y_task.id).is_some());

    let loaded = eventually(|| {
        let db = db.clone();
        let y_id = y_task.id;
        async move {
            let tasks = db.get_all_tasks().await.unwrap();
            tasks.len() == 1 && tasks[0].id == y_id
        }
    })
    .await;
    assert!(loaded);

    let items = client.fetch().await.unwrap();
    assert!(items.iter().all(|t| t.owner_identity == "user-y"));
    assert_eq!(
        client.database().current_identity().await.unwrap().as_deref(),
        Some("user-y")
    );
}

#[tokio::test]
async fn test_identity_change_handler_clears_before_reload() {
    let transport = Arc::new(InMemoryTransport::new("user-y"));
    let client = setup_client(transport.clone()).await;
    for i in 0..3 {
        client.add(make_task(&format!("task {}", i), i)).await.unwrap();
    }

    client.wait_for_background().await;

    let seen = record_events(&client.events());
    let reloaded = client.reactor().on_identity_changed("user-y").await.unwrap();
    assert!(reloaded.is_empty());
    assert!(!client.session().is_remote_disabled());
    assert_eq!(
        &seen.lock().unwrap()[..2],
        &[
            SyncEvent::SyncStatusChanged(SyncState::Idle),
            SyncEvent::DataRefreshed
        ]
    );
}

#[tokio::test]
async fn test_pull_started_before_account_switch_is_discarded() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;
    assert!(client.session().ensure_authenticated().await);

    let mut x_task = make_task("x's remote task", 0);
    x_task.owner_identity = "user-x".to_string();
    transport.insert_record(TodoRecord::from_item(&x_task));
    transport.set_request_delay(Duration::from_millis(200));

    let pull = {
        let coordinator = client.coordinator().clone();
        tokio::spawn(async move { coordinator.pull_remote().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The session moves on to user-y while the query for user-x is in flight.
    transport.set_account(Some("user-y"));
    assert!(!client.session().refresh_authentication().await);
    assert_eq!(client.session().current_identity().as_deref(), Some("user-y"));

    assert_eq!(pull.await.unwrap().unwrap(), 0);
    client.wait_for_background().await;
    assert!(client.fetch().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sign_out_forgets_identity() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;
    client.add(make_task("before logout", 0)).await.unwrap();
    client.wait_for_background().await;

    client.sign_out().await.unwrap();
    assert_eq!(client.session().current_identity(), None);
    assert!(!client.session().snapshot().authenticated);
    assert!(client.database().get_all_tasks().await.unwrap().is_empty());
    assert_eq!(client.database().current_identity().await.unwrap(), None);

    // Written while signed out: not stamped with the old identity.
    let task = client.add(make_task("after logout", 0)).await.unwrap();
    assert_eq!(task.owner_identity, "");

    client.wait_for_background().await;
    assert_eq!(transport.auth_calls(), 2);
    assert_eq!(
        client.database().current_identity().await.unwrap().as_deref(),
        Some("user-x")
    );
}

#[tokio::test]
async fn test_remote_unavailable_clears_and_resets() {
    let transport = Arc::new(InMemoryTransport::new("user-x"));
    let client = setup_client(transport.clone()).await;

    client.add(make_task("cached", 0)).await.unwrap();
    client.wait_for_background().await;
    assert_eq!(transport.auth_calls(), 1);
    let requests_before = transport.request_calls();

    client.events().emit_remote_unavailable();

    let db = client.database().clone();
    assert!(
        eventually(|| {
            let db = db.clone();
            async move { db.get_all_tasks().await.unwrap().is_empty() }
        })
        .await
    );

    // The session comes back by itself after the reset delay, with no pull.
    assert!(eventually(|| async { transport.auth_calls() == 2 }).await);
    assert!(eventually(|| async { client.session().snapshot().authenticated }).await);
    assert_eq!(client.session().current_identity().as_deref(), Some("user-x"));
    assert_eq!(transport.request_calls(), requests_before);
    assert!(client.fetch().await.unwrap().is_empty());
}
