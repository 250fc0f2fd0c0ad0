//! Session lifecycle against an in-process hub server.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{GOOGLE_TOKEN, IDENTIFIER, SECRET, TestHub, USER_ID, spawn_hub};
use futures::future::join_all;
use hub_client::{
    ClientError, CredentialStore, HubClient, MemoryCredentialStore, RefreshPhase, RequestSpec,
    SessionEvent,
};
use serde_json::Value;

fn client(hub: &TestHub) -> (HubClient, Arc<MemoryCredentialStore>) {
    let store = Arc::new(MemoryCredentialStore::new());
    let client = HubClient::with_store(hub.config(), store.clone()).unwrap();
    (client, store)
}

async fn logged_in(hub: &TestHub) -> (HubClient, Arc<MemoryCredentialStore>) {
    let (client, store) = client(hub);
    client.login(IDENTIFIER, SECRET).await.unwrap();
    (client, store)
}

fn protected() -> RequestSpec {
    RequestSpec::get("protected/")
}

#[tokio::test]
async fn login_stores_credentials_and_profile() {
    let hub = spawn_hub().await;
    let (client, store) = client(&hub);
    let mut events = client.session().subscribe();

    let session = client.login(IDENTIFIER, SECRET).await.unwrap();
    assert_eq!(session.user_id, USER_ID);

    let access = store.access().await.unwrap();
    assert!(!access.is_empty());
    assert!(!store.refresh().await.unwrap().is_empty());
    assert_eq!(access, session.access);

    let profile = client.session().profile().unwrap();
    assert_eq!(profile.email.as_deref(), Some(IDENTIFIER));
    assert_eq!(profile.extra["first_name"], "Uma");
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::LoggedIn { user_id: USER_ID }
    );

    let me: Value = client
        .gateway()
        .call_json(&RequestSpec::get("/auth/users/me/").absolute())
        .await
        .unwrap();
    assert_eq!(me["id"], USER_ID);
}

#[tokio::test]
async fn rejected_login_leaves_existing_session_untouched() {
    let hub = spawn_hub().await;
    let (client, store) = logged_in(&hub).await;
    let before = store.access().await;

    let err = client.login(IDENTIFIER, "wrong").await.unwrap_err();
    match err {
        ClientError::InvalidCredentials(detail) => {
            assert_eq!(detail, "No active account found with the given credentials")
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(store.access().await, before);
    assert_eq!(client.session().user_id(), Some(USER_ID));
}

#[tokio::test]
async fn federated_login() {
    let hub = spawn_hub().await;
    let (client, store) = client(&hub);

    let err = client.login_with_federated_token("bogus").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidCredentials(_)));
    assert_eq!(store.access().await, None);

    let session = client.login_with_federated_token(GOOGLE_TOKEN).await.unwrap();
    assert_eq!(session.user_id, USER_ID);
    assert!(store.refresh().await.is_some());
}

#[tokio::test]
async fn unauthenticated_call_is_rejected_locally() {
    let hub = spawn_hub().await;
    let (client, _store) = client(&hub);

    let err = client.gateway().call(&protected()).await.unwrap_err();
    assert!(matches!(err, ClientError::NotAuthenticated));
    assert_eq!(hub.state.protected_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_access_is_renewed_transparently() {
    let hub = spawn_hub().await;
    let (client, store) = logged_in(&hub).await;
    let old_access = store.access().await.unwrap();
    let old_refresh = store.refresh().await.unwrap();
    let mut events = client.session().subscribe();

    hub.state.expire_access();
    let body: Value = client.gateway().call_json(&protected()).await.unwrap();

    assert_eq!(body["ok"], true);
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 1);
    assert_eq!(hub.state.protected_hits.load(Ordering::SeqCst), 2);

    let new_access = store.access().await.unwrap();
    assert_ne!(new_access, old_access);
    assert!(hub.state.is_valid_access(&new_access));
    assert_eq!(store.refresh().await.unwrap(), old_refresh);
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Renewed);
    assert_eq!(client.refresher().phase(), RefreshPhase::Idle);
}

#[tokio::test]
async fn rotated_refresh_credential_is_stored() {
    let hub = spawn_hub().await;
    let (client, store) = logged_in(&hub).await;
    let old_refresh = store.refresh().await.unwrap();

    hub.state.rotate_refresh.store(true, Ordering::SeqCst);
    hub.state.expire_access();
    client.gateway().call(&protected()).await.unwrap();

    let new_refresh = store.refresh().await.unwrap();
    assert_ne!(new_refresh, old_refresh);
}

#[tokio::test]
async fn concurrent_rejections_share_one_renewal() {
    const CALLS: usize = 8;

    let hub = spawn_hub().await;
    let (client, _store) = logged_in(&hub).await;
    hub.state.renewal_delay_ms.store(200, Ordering::SeqCst);
    hub.state.expire_access();

    let spec = protected();
    let results = join_all((0..CALLS).map(|_| client.gateway().call(&spec))).await;

    for result in &results {
        assert!(result.is_ok(), "call failed: {result:?}");
    }
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 1);
    assert_eq!(client.refresher().renewal_count(), 1);
    assert_eq!(hub.state.protected_hits.load(Ordering::SeqCst), CALLS * 2);
}

#[tokio::test]
async fn concurrent_rejections_share_one_renewal_across_tasks() {
    const CALLS: usize = 6;

    let hub = spawn_hub().await;
    let (client, _store) = logged_in(&hub).await;
    hub.state.renewal_delay_ms.store(200, Ordering::SeqCst);
    hub.state.expire_access();

    let handles: Vec<_> = (0..CALLS)
        .map(|_| {
            let gateway = client.gateway().clone();
            tokio::spawn(async move { gateway.call(&protected()).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 1);
    assert_eq!(hub.state.protected_hits.load(Ordering::SeqCst), CALLS * 2);
}

#[tokio::test]
async fn failed_renewal_forces_logout_once() {
    const CALLS: usize = 5;

    let hub = spawn_hub().await;
    let (client, store) = logged_in(&hub).await;
    let forced = Arc::new(AtomicUsize::new(0));
    let counter = forced.clone();
    client.session().on_forced_logout(move |_reason| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    hub.state.reject_renewals.store(true, Ordering::SeqCst);
    hub.state.renewal_delay_ms.store(100, Ordering::SeqCst);
    hub.state.expire_access();

    let spec = protected();
    let results = join_all((0..CALLS).map(|_| client.gateway().call(&spec))).await;

    for result in results {
        assert!(matches!(result, Err(ClientError::RenewalFailed(_))));
    }
    assert_eq!(forced.load(Ordering::SeqCst), 1);
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 1);
    // Only the original attempts reached the server; nothing was retried.
    assert_eq!(hub.state.protected_hits.load(Ordering::SeqCst), CALLS);
    assert_eq!(store.access().await, None);
    assert_eq!(store.refresh().await, None);
    assert!(client.session().profile().is_none());
}

#[tokio::test]
async fn renewal_is_not_retried_after_failure() {
    let hub = spawn_hub().await;
    let (client, _store) = logged_in(&hub).await;
    hub.state.reject_renewals.store(true, Ordering::SeqCst);

    let first = client.refresher().ensure_fresh().await;
    assert!(matches!(first, Err(ClientError::RenewalFailed(_))));

    let second = client.refresher().ensure_fresh().await;
    assert!(second.unwrap_err().requires_relogin());
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 1);

    // A new login starts over.
    hub.state.reject_renewals.store(false, Ordering::SeqCst);
    client.login(IDENTIFIER, SECRET).await.unwrap();
    assert_eq!(client.refresher().phase(), RefreshPhase::Idle);
    client.refresher().ensure_fresh().await.unwrap();
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 2);
}

/// Log in, then start a renewal that the hub will reject after `delay_ms`.
/// Returns the pending renewal after a second login replaced the session.
async fn relogin_during_rejected_renewal(
    hub: &TestHub,
    client: &HubClient,
    store: &MemoryCredentialStore,
) -> tokio::task::JoinHandle<hub_client::Result<String>> {
    let stale_refresh = store.refresh().await.unwrap();
    hub.state.renewal_delay_ms.store(300, Ordering::SeqCst);

    let refresher = client.refresher().clone();
    let pending = tokio::spawn(async move { refresher.ensure_fresh().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.refresher().phase(), RefreshPhase::Renewing);

    hub.state.revoke_refresh(&stale_refresh);
    client.login(IDENTIFIER, SECRET).await.unwrap();
    hub.state.renewal_delay_ms.store(0, Ordering::SeqCst);
    pending
}

#[tokio::test]
async fn stale_renewal_failure_spares_the_new_session() {
    let hub = spawn_hub().await;
    let (client, store) = logged_in(&hub).await;
    let forced = Arc::new(AtomicUsize::new(0));
    let counter = forced.clone();
    client.session().on_forced_logout(move |_reason| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let pending = relogin_during_rejected_renewal(&hub, &client, &store).await;
    let stale = pending.await.unwrap();
    assert!(matches!(stale, Err(ClientError::RenewalFailed(_))));

    // The new session was not destroyed and can still renew.
    assert_eq!(forced.load(Ordering::SeqCst), 0);
    assert!(store.refresh().await.is_some());
    assert!(client.session().profile().is_some());
    assert_eq!(client.refresher().phase(), RefreshPhase::Idle);

    hub.state.expire_access();
    let response = client.gateway().call(&protected()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn new_session_does_not_join_stale_renewal() {
    let hub = spawn_hub().await;
    let (client, store) = logged_in(&hub).await;

    let pending = relogin_during_rejected_renewal(&hub, &client, &store).await;

    // Issued while the stale renewal is still waiting on the hub.
    let fresh = client.refresher().ensure_fresh().await.unwrap();
    assert_eq!(store.access().await, Some(fresh));
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 2);

    assert!(matches!(
        pending.await.unwrap(),
        Err(ClientError::RenewalFailed(_))
    ));
    assert_eq!(client.refresher().phase(), RefreshPhase::Idle);
    assert!(store.refresh().await.is_some());
}

#[tokio::test]
async fn second_rejection_surfaces_auth_expired() {
    let hub = spawn_hub().await;
    let (client, store) = logged_in(&hub).await;
    hub.state.reject_protected.store(true, Ordering::SeqCst);

    let err = client.gateway().call(&protected()).await.unwrap_err();
    assert!(matches!(err, ClientError::AuthExpired));
    assert_eq!(hub.state.protected_hits.load(Ordering::SeqCst), 2);
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 1);
    // The session survives: the renewal itself succeeded.
    assert!(store.refresh().await.is_some());
}

#[tokio::test]
async fn server_errors_do_not_touch_the_session() {
    let hub = spawn_hub().await;
    let (client, store) = logged_in(&hub).await;
    let before = store.access().await;

    let err = client
        .gateway()
        .call(&RequestSpec::get("broken/"))
        .await
        .unwrap_err();
    match err {
        ClientError::Api { status, body } => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 0);
    assert_eq!(store.access().await, before);
}

#[tokio::test]
async fn logout_is_idempotent() {
    let hub = spawn_hub().await;
    let (client, store) = logged_in(&hub).await;

    client.logout().await.unwrap();
    client.logout().await.unwrap();

    assert_eq!(store.access().await, None);
    assert!(client.session().profile().is_none());
    assert!(matches!(
        client.gateway().call(&protected()).await,
        Err(ClientError::NotAuthenticated)
    ));
}

#[tokio::test]
async fn persisted_session_is_restored() {
    let hub = spawn_hub().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");

    let first = HubClient::new(hub.config().with_credentials_path(&path)).unwrap();
    first.login(IDENTIFIER, SECRET).await.unwrap();
    drop(first);

    // Access expired while the client was not running.
    hub.state.expire_access();

    let second = HubClient::new(hub.config().with_credentials_path(&path)).unwrap();
    assert!(second.session().profile().is_none());
    let profile = second.restore_session().await.unwrap().unwrap();
    assert_eq!(profile.id, USER_ID);
    assert_eq!(second.session().user_id(), Some(USER_ID));
    assert_eq!(hub.state.renewals.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn restore_without_credentials_is_none() {
    let hub = spawn_hub().await;
    let (client, _store) = client(&hub);
    assert!(client.restore_session().await.unwrap().is_none());
}
