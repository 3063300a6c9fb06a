//! Session lifecycle tests: login, expiry, extension, logout and restore

mod helpers;

use chrono::Duration;
use helpers::*;
use serde_json::json;
use std::sync::Arc;
use tillguard_core::SessionSettings;
use tillguard_session::{
    ActivitySignal, ApiResponse, AuthApi, CredentialStore, LogoutReason, ManualClock, MemoryBackend,
    Permission, Role, SessionError, SessionEvent, SessionManager, SessionRecord, SessionStatus,
    StorageBackend, TokenPair, User,
};

fn forced_logouts(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ForcedLogout { .. }))
        .count()
}

#[tokio::test]
async fn test_login_sets_expiry_one_duration_ahead() {
    let session = TestSession::new().with_auth_routes("cashier");
    let mut events = session.manager.subscribe();

    let user = session.manager.login("Alice", PASSWORD).await.unwrap();

    assert_eq!(user.username, "alice");
    assert_eq!(user.role, Role::Cashier);
    assert_eq!(session.manager.status().await, SessionStatus::Authenticated);
    assert!(session.manager.is_authenticated().await);

    let expected = start_time() + Duration::milliseconds(3_600_000);
    assert_eq!(session.manager.expires_at().await, Some(expected));

    let stored = session.store.load().unwrap().unwrap();
    assert_eq!(stored.expires_at, expected);
    assert_eq!(stored.last_activity, start_time());
    assert_eq!(stored.tokens, TokenPair::new(ACCESS, REFRESH));
    assert!(stored.permissions.contains(&Permission::SalesCreate));

    // Username is normalized before it reaches the server
    assert_eq!(
        session.transport.last_body(LOGIN).unwrap()["username"],
        json!("alice")
    );
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::LoggedIn {
            username: "alice".to_string()
        }]
    );
}

#[tokio::test]
async fn test_missing_fields_fail_without_remote_call() {
    let session = TestSession::new().with_auth_routes("cashier");

    let result = session.manager.login("   ", PASSWORD).await;
    assert!(matches!(result, Err(SessionError::Validation { ref field, .. }) if field == "username"));

    let result = session.manager.login("alice", "").await;
    assert!(matches!(result, Err(SessionError::Validation { ref field, .. }) if field == "password"));

    assert_eq!(session.transport.calls_to(LOGIN), 0);
    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
}

#[tokio::test]
async fn test_wrong_password_is_invalid_credentials() {
    let session = TestSession::new().with_auth_routes("cashier");

    let result = session.manager.login("alice", "wrong").await;

    assert!(matches!(result, Err(SessionError::InvalidCredentials)));
    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
    assert!(session.store.load().unwrap().is_none());
}

#[tokio::test]
async fn test_disabled_accounts_are_classified() {
    let session = TestSession::new();
    session.transport.respond(
        LOGIN,
        401,
        json!({ "detail": "User account is disabled." }),
    );
    let result = session.manager.login("alice", PASSWORD).await;
    assert!(matches!(result, Err(SessionError::AccountDisabled)));

    session.transport.respond(LOGIN, 403, json!({}));
    let result = session.manager.login("alice", PASSWORD).await;
    assert!(matches!(result, Err(SessionError::AccountDisabled)));

    let mut body = login_body("alice", "cashier");
    body["user"]["is_active"] = json!(false);
    session.transport.respond(LOGIN, 200, body);
    let result = session.manager.login("alice", PASSWORD).await;
    assert!(matches!(result, Err(SessionError::AccountDisabled)));

    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
    assert!(session.store.load().unwrap().is_none());
}

#[tokio::test]
async fn test_network_failure_leaves_state_unchanged() {
    let session = TestSession::new();
    session.transport.fail(LOGIN);

    let error = session.manager.login("alice", PASSWORD).await.unwrap_err();

    assert!(matches!(error, SessionError::Network { .. }));
    assert!(error.is_recoverable());
    assert!(error.user_message().contains("connection"));
    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
}

#[tokio::test]
async fn test_unknown_role_creates_no_session() {
    let session = TestSession::new();
    session
        .transport
        .respond(LOGIN, 200, login_body("alice", "bartender"));

    let result = session.manager.login("alice", PASSWORD).await;

    assert!(matches!(result, Err(SessionError::Protocol { .. })));
    assert!(!session.manager.is_authenticated().await);
    assert!(session.store.load().unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_login_is_rejected() {
    let session = TestSession::new();
    let body = login_body("alice", "cashier").to_string();
    session
        .transport
        .on_delayed(LOGIN, std::time::Duration::from_millis(50), move |_, _| {
            ApiResponse::new(200, body.clone())
        });

    let (first, second) = tokio::join!(
        session.manager.login("alice", PASSWORD),
        session.manager.login("alice", PASSWORD)
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(SessionError::LoginInProgress)));
    assert_eq!(session.transport.calls_to(LOGIN), 1);
    assert!(session.manager.is_authenticated().await);
}

/// `login` answers only after `delay`
fn slow_login(session: &TestSession, delay: std::time::Duration) {
    let body = login_body("alice", "cashier").to_string();
    session
        .transport
        .on_delayed(LOGIN, delay, move |_, _| ApiResponse::new(200, body.clone()));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_login_does_not_block_the_next_one() {
    let session = TestSession::new().with_auth_routes("cashier");
    slow_login(&session, std::time::Duration::from_secs(60));

    let abandoned = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        session.manager.login("alice", PASSWORD),
    )
    .await;
    assert!(abandoned.is_err());

    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
    assert_eq!(
        session.manager.restore().await.unwrap(),
        SessionStatus::Anonymous
    );

    let session = session.with_auth_routes("cashier");
    let user = session.manager.login("alice", PASSWORD).await.unwrap();
    assert_eq!(user.username, "alice");
    assert_eq!(session.manager.status().await, SessionStatus::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn test_logout_during_login_cancels_it() {
    let session = TestSession::new().with_auth_routes("cashier");
    slow_login(&session, std::time::Duration::from_secs(3));
    let mut events = session.manager.subscribe();

    let manager = session.manager.clone();
    let pending = tokio::spawn(async move { manager.login("alice", PASSWORD).await });

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert_eq!(
        session.manager.status().await,
        SessionStatus::Authenticating
    );

    session.manager.logout().await.unwrap();
    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SessionError::LoginCancelled)));
    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
    assert!(session.store.load().unwrap().is_none());
    assert!(!session.manager.is_tracking_activity());
    assert!(!session.manager.is_validator_running());
    assert!(drain(&mut events).is_empty());

    // The slot is free again
    let session = session.with_auth_routes("cashier");
    assert!(session.manager.login("alice", PASSWORD).await.is_ok());
}

#[tokio::test]
async fn test_login_while_signed_in_replaces_session() {
    let session = TestSession::logged_in("cashier").await;
    let mut events = session.manager.subscribe();

    session
        .transport
        .respond(LOGIN, 200, login_body("bob", "manager"));
    let user = session.manager.login("bob", PASSWORD).await.unwrap();

    assert_eq!(user.username, "bob");
    assert!(session.manager.is_manager().await);
    assert_eq!(session.store.load().unwrap().unwrap().user.username, "bob");
    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::LoggedOut {
                username: "alice".to_string()
            },
            SessionEvent::LoggedIn {
                username: "bob".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_expired_session_denies_and_forces_one_logout() {
    let session = TestSession::logged_in("manager").await;
    let mut events = session.manager.subscribe();

    session.clock.advance(Duration::milliseconds(3_600_001));

    let record = session.store.load().unwrap().unwrap();
    assert!(session.manager.is_session_expired(&record));
    assert_eq!(session.manager.status().await, SessionStatus::Expired);

    assert!(!session.manager.has_permission(Permission::OrdersView).await);
    assert!(!session.manager.can_access_menu("dashboard").await);
    assert!(!session.manager.is_manager().await);
    assert!(!session.manager.is_authenticated().await);

    let events = drain(&mut events);
    assert_eq!(forced_logouts(&events), 1);
    assert_eq!(
        events[0],
        SessionEvent::ForcedLogout {
            reason: LogoutReason::Expired
        }
    );
    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
    assert!(session.store.load().unwrap().is_none());
    assert!(session.store.access_token().unwrap().is_none());
}

#[tokio::test]
async fn test_session_is_live_until_the_expiry_instant() {
    let session = TestSession::logged_in("cashier").await;

    session.clock.advance(Duration::milliseconds(3_600_000));
    assert!(session.manager.is_authenticated().await);

    session.clock.advance(Duration::milliseconds(1));
    assert!(!session.manager.is_authenticated().await);
}

#[tokio::test]
async fn test_force_logout_is_idempotent() {
    let session = TestSession::logged_in("server").await;
    let mut events = session.manager.subscribe();

    assert!(session
        .manager
        .force_logout(LogoutReason::ValidationFailed)
        .await
        .unwrap());
    assert!(!session
        .manager
        .force_logout(LogoutReason::ValidationFailed)
        .await
        .unwrap());

    assert_eq!(forced_logouts(&drain(&mut events)), 1);
    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
    assert!(!session.manager.is_tracking_activity());
    assert!(!session.manager.is_validator_running());
    assert!(session.store.load().unwrap().is_none());
    assert_eq!(session.transport.calls_to(LOGOUT), 0);
}

#[tokio::test]
async fn test_logout_clears_locally_when_remote_fails() {
    let session = TestSession::logged_in("cashier").await;
    session
        .transport
        .respond(LOGOUT, 500, json!({ "detail": "boom" }));

    session.manager.logout().await.unwrap();

    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
    assert!(session.store.load().unwrap().is_none());
    assert_eq!(session.transport.bearers(LOGOUT), vec![Some(ACCESS.to_string())]);
    assert_eq!(
        session.transport.last_body(LOGOUT),
        Some(json!({ "refresh": REFRESH }))
    );

    // Anonymous logout is harmless
    session.manager.logout().await.unwrap();
    assert_eq!(session.transport.calls_to(LOGOUT), 1);
}

#[tokio::test]
async fn test_extend_session() {
    let session = TestSession::new().with_auth_routes("cashier");
    assert!(matches!(
        session.manager.extend_session().await,
        Err(SessionError::NotAuthenticated)
    ));

    session.manager.login("alice", PASSWORD).await.unwrap();
    session.clock.advance(Duration::minutes(10));

    let expires_at = session.manager.extend_session().await.unwrap();
    let now = session.manager.now();
    assert_eq!(expires_at, now + Duration::hours(1));

    let stored = session.store.load().unwrap().unwrap();
    assert_eq!(stored.last_activity, now);
    assert_eq!(stored.expires_at, expires_at);
    assert!(stored.expires_at > stored.last_activity);

    session.clock.advance(Duration::hours(2));
    assert!(matches!(
        session.manager.extend_session().await,
        Err(SessionError::SessionExpired)
    ));
    assert_eq!(session.manager.status().await, SessionStatus::Anonymous);
}

#[tokio::test]
async fn test_activity_extends_at_most_once_per_window() {
    let session = TestSession::logged_in("cashier").await;

    let mut extensions = 0;
    for _ in 0..35 {
        if session
            .manager
            .record_activity(ActivitySignal::PointerMove)
            .await
            .unwrap()
        {
            extensions += 1;
        }
        session.clock.advance(Duration::seconds(1));
    }

    assert_eq!(extensions, 2);

    session.manager.logout().await.unwrap();
    assert!(!session
        .manager
        .record_activity(ActivitySignal::Click)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_permission_accessors_follow_role() {
    let session = TestSession::logged_in("server").await;

    assert!(session.manager.is_server().await);
    assert!(!session.manager.is_admin().await);
    assert!(session.manager.has_permission(Permission::OrdersCreate).await);
    assert!(!session.manager.has_permission(Permission::StockEdit).await);
    assert!(
        session
            .manager
            .has_any_permission(&[Permission::StockEdit, Permission::SalesView])
            .await
    );
    assert!(
        !session
            .manager
            .has_all_permissions(&[Permission::StockEdit, Permission::SalesView])
            .await
    );
    assert!(!session.manager.can_access_menu("users").await);
    assert_eq!(
        session.manager.accessible_menus().await,
        vec!["dashboard", "orders", "sales"]
    );

    assert!(session
        .manager
        .require_permission(Permission::OrdersEdit)
        .await
        .is_ok());
    assert!(matches!(
        session.manager.require_permission(Permission::UsersEdit).await,
        Err(SessionError::Forbidden { ref permission }) if permission == "users.edit"
    ));

    session.manager.logout().await.unwrap();
    assert!(matches!(
        session.manager.require_permission(Permission::OrdersEdit).await,
        Err(SessionError::NotAuthenticated)
    ));
}

#[tokio::test]
async fn test_superuser_gets_every_permission() {
    let session = TestSession::new();
    let mut body = login_body("root", "cashier");
    body["user"]["is_superuser"] = json!(true);
    session.transport.respond(LOGIN, 200, body);

    session.manager.login("root", PASSWORD).await.unwrap();

    assert!(session.manager.is_admin().await);
    assert!(session.manager.has_permission(Permission::SettingsEdit).await);
    assert_eq!(session.manager.permissions().await.len(), Permission::ALL.len());
    assert!(!session.manager.can_access_menu("no-such-menu").await);
}

#[tokio::test]
async fn test_permissions_endpoint_can_override_role() {
    let settings = SessionSettings::default();
    let session = TestSession::build(settings.clone(), true).with_auth_routes("cashier");
    session
        .transport
        .respond(PERMISSIONS, 200, json!({ "role": "Manager", "permissions": [] }));

    session.manager.login("alice", PASSWORD).await.unwrap();
    assert!(session.manager.is_manager().await);
    assert_eq!(session.transport.bearers(PERMISSIONS), vec![Some(ACCESS.to_string())]);

    // Enrichment failures are ignored
    let session = TestSession::build(settings, true).with_auth_routes("cashier");
    session.transport.fail(PERMISSIONS);
    session.manager.login("alice", PASSWORD).await.unwrap();
    assert!(session.manager.is_cashier().await);
}

#[tokio::test]
async fn test_refresh_replaces_only_the_access_token() {
    let session = TestSession::logged_in("cashier").await;
    session
        .transport
        .respond(REFRESH_PATH, 200, json!({ "access": REFRESHED_ACCESS }));
    let before = session.store.load().unwrap().unwrap();

    assert!(session.manager.refresh().await);

    let after = session.store.load().unwrap().unwrap();
    assert_eq!(after.tokens, TokenPair::new(REFRESHED_ACCESS, REFRESH));
    assert_eq!(after.expires_at, before.expires_at);
    assert_eq!(after.user, before.user);
    assert_eq!(
        session.store.access_token().unwrap().as_deref(),
        Some(REFRESHED_ACCESS)
    );
    assert_eq!(
        session.manager.access_token().await.as_deref(),
        Some(REFRESHED_ACCESS)
    );
    assert_eq!(
        session.transport.last_body(REFRESH_PATH),
        Some(json!({ "refresh": REFRESH }))
    );
}

#[tokio::test]
async fn test_refresh_failure_forces_logout() {
    let session = TestSession::logged_in("cashier").await;
    let mut events = session.manager.subscribe();
    session.transport.respond(
        REFRESH_PATH,
        401,
        json!({ "detail": "Token is invalid or expired" }),
    );

    assert!(!session.manager.refresh().await);

    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::ForcedLogout {
            reason: LogoutReason::RefreshFailed
        }]
    );
    assert!(!session.manager.is_authenticated().await);
    assert!(session.store.load().unwrap().is_none());
}

const BOB_ACCESS: &str = "bob-access";
const BOB_REFRESH: &str = "bob-refresh";

/// Sign alice out and bob in while alice's refresh is still on the wire
async fn switch_to_bob(session: &TestSession) {
    session.manager.logout().await.unwrap();

    let mut body = login_body("bob", "cashier");
    body["tokens"] = json!({ "access": BOB_ACCESS, "refresh": BOB_REFRESH });
    session.transport.respond(LOGIN, 200, body);
    session.manager.login("bob", PASSWORD).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_refresh_result_never_lands_in_the_next_session() {
    let session = TestSession::logged_in("cashier").await;
    session.transport.on_delayed(
        REFRESH_PATH,
        std::time::Duration::from_secs(1),
        |_, _| ApiResponse::new(200, r#"{"access":"alice-fresh"}"#),
    );

    let manager = session.manager.clone();
    let pending = tokio::spawn(async move { manager.refresh().await });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    switch_to_bob(&session).await;
    let mut events = session.manager.subscribe();

    assert!(!pending.await.unwrap());
    assert_eq!(
        session.manager.access_token().await.as_deref(),
        Some(BOB_ACCESS)
    );
    assert_eq!(session.store.access_token().unwrap().as_deref(), Some(BOB_ACCESS));
    assert_eq!(
        session.store.load().unwrap().unwrap().tokens,
        TokenPair::new(BOB_ACCESS, BOB_REFRESH)
    );
    assert!(drain(&mut events).is_empty());

    // Bob's own refresh starts a new exchange with his token
    session
        .transport
        .respond(REFRESH_PATH, 200, json!({ "access": "bob-fresh" }));
    assert!(session.manager.refresh().await);
    assert_eq!(
        session.transport.last_body(REFRESH_PATH),
        Some(json!({ "refresh": BOB_REFRESH }))
    );
    assert_eq!(
        session.manager.access_token().await.as_deref(),
        Some("bob-fresh")
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_of_ended_session_keeps_the_next_one() {
    let session = TestSession::logged_in("cashier").await;
    session.transport.on_delayed(
        REFRESH_PATH,
        std::time::Duration::from_secs(1),
        |_, _| ApiResponse::new(401, r#"{"detail":"Token is blacklisted"}"#),
    );

    let manager = session.manager.clone();
    let pending = tokio::spawn(async move { manager.refresh().await });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    switch_to_bob(&session).await;
    let mut events = session.manager.subscribe();

    assert!(!pending.await.unwrap());
    assert_eq!(forced_logouts(&drain(&mut events)), 0);
    assert_eq!(session.manager.current_user().await.unwrap().username, "bob");
    assert!(session.store.load().unwrap().is_some());
}

#[tokio::test]
async fn test_restore_picks_up_a_live_session() {
    let session = TestSession::logged_in("manager").await;

    let api = AuthApi::new(session.transport.clone(), Default::default());
    let restored = SessionManager::builder(api)
        .store(session.store.clone())
        .clock(Arc::new(session.clock.clone()))
        .build()
        .unwrap();

    assert_eq!(restored.restore().await.unwrap(), SessionStatus::Authenticated);
    assert_eq!(restored.current_user().await.unwrap().username, "alice");
    assert!(restored.is_manager().await);
    assert!(restored.is_tracking_activity());
}

#[tokio::test]
async fn test_restore_discards_stale_and_corrupt_records() {
    init_tracing();
    let clock = ManualClock::new(start_time());
    let backend = Arc::new(MemoryBackend::new());
    let store = CredentialStore::new(backend.clone(), "tillguard");
    let api = AuthApi::new(MockTransport::new(), Default::default());
    let manager = SessionManager::builder(api)
        .store(store.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    let user = User {
        id: "7".to_string(),
        username: "alice".to_string(),
        display_name: "alice".to_string(),
        email: None,
        first_name: String::new(),
        last_name: String::new(),
        role: Role::Cashier,
        is_active: true,
        is_staff: false,
        is_superuser: false,
        date_joined: None,
    };
    let lapsed = SessionRecord::new(
        user.clone(),
        TokenPair::new(ACCESS, REFRESH),
        Default::default(),
        start_time() - Duration::hours(2),
        Duration::hours(1),
    );
    store.save(&lapsed).unwrap();
    assert_eq!(manager.restore().await.unwrap(), SessionStatus::Anonymous);
    assert!(store.load().unwrap().is_none());

    // An empty access token is never authenticated
    let tokenless = SessionRecord::new(
        user,
        TokenPair::new("", REFRESH),
        Default::default(),
        start_time(),
        Duration::hours(1),
    );
    store.save(&tokenless).unwrap();
    assert_eq!(manager.restore().await.unwrap(), SessionStatus::Anonymous);

    backend
        .write_batch(&[(store.session_key(), Some("not json".to_string()))])
        .unwrap();
    assert_eq!(manager.restore().await.unwrap(), SessionStatus::Anonymous);
    assert!(backend.is_empty());
}
