//! Auth gateway tests: bearer attachment, 401 recovery and refresh coalescing

mod helpers;

use helpers::*;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tillguard_session::{
    ApiRequest, ApiResponse, AuthGateway, LogoutReason, SessionError, SessionEvent, StorageBackend,
};

const ORDERS: &str = "orders";

#[derive(Debug, Deserialize, PartialEq)]
struct Order {
    id: u32,
    table: String,
}

/// `orders` accepts only the refreshed token
fn orders_require_refreshed_token(session: &TestSession) {
    session.transport.on(ORDERS, |_, bearer| {
        if bearer == Some(REFRESHED_ACCESS) {
            ApiResponse::new(200, r#"[{"id":1,"table":"T4"}]"#)
        } else {
            ApiResponse::new(401, r#"{"detail":"Token is invalid or expired"}"#)
        }
    });
}

#[tokio::test]
async fn test_bearer_is_attached() {
    let session = TestSession::logged_in("server").await;
    session.transport.respond(ORDERS, 200, json!([]));
    let gateway = AuthGateway::for_session(session.manager.clone());

    let response = gateway.send(&ApiRequest::get(ORDERS)).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(session.transport.bearers(ORDERS), vec![Some(ACCESS.to_string())]);
    assert_eq!(session.transport.calls_to(REFRESH_PATH), 0);
}

#[tokio::test]
async fn test_bearer_comes_from_the_stored_token_entry() {
    let session = TestSession::logged_in("server").await;
    session.transport.respond(ORDERS, 200, json!([]));
    let gateway = AuthGateway::for_session(session.manager.clone());

    // Another client sharing the store rotated the access token
    session
        .store
        .backend()
        .write_batch(&[(
            session.store.access_token_key(),
            Some(REFRESHED_ACCESS.to_string()),
        )])
        .unwrap();

    gateway.send(&ApiRequest::get(ORDERS)).await.unwrap();
    assert_eq!(
        session.transport.bearers(ORDERS),
        vec![Some(REFRESHED_ACCESS.to_string())]
    );

    // An expired session sends nothing, whatever the store still holds
    session.clock.advance(chrono::Duration::hours(2));
    let result = gateway.send(&ApiRequest::get(ORDERS)).await;
    assert_eq!(result.unwrap().status, 200);
    assert_eq!(session.transport.bearers(ORDERS).last(), Some(&None));
}

#[tokio::test]
async fn test_unauthorized_request_is_retried_once_after_refresh() {
    let session = TestSession::logged_in("server").await;
    orders_require_refreshed_token(&session);
    session
        .transport
        .respond(REFRESH_PATH, 200, json!({ "access": REFRESHED_ACCESS }));
    let gateway = AuthGateway::for_session(session.manager.clone());

    let orders: Vec<Order> = gateway.get_json(ORDERS).await.unwrap();

    assert_eq!(
        orders,
        vec![Order {
            id: 1,
            table: "T4".to_string()
        }]
    );
    assert_eq!(session.transport.calls_to(REFRESH_PATH), 1);
    assert_eq!(
        session.transport.bearers(ORDERS),
        vec![Some(ACCESS.to_string()), Some(REFRESHED_ACCESS.to_string())]
    );
    assert!(session.manager.is_authenticated().await);
}

#[tokio::test]
async fn test_failed_refresh_forces_one_logout() {
    let session = TestSession::logged_in("server").await;
    let mut events = session.manager.subscribe();
    orders_require_refreshed_token(&session);
    session
        .transport
        .respond(REFRESH_PATH, 401, json!({ "detail": "Token is blacklisted" }));
    let gateway = AuthGateway::for_session(session.manager.clone());

    let result = gateway.send(&ApiRequest::get(ORDERS)).await;

    assert!(matches!(result, Err(SessionError::SessionExpired)));
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::ForcedLogout {
            reason: LogoutReason::RefreshFailed
        }]
    );
    assert_eq!(session.transport.calls_to(ORDERS), 1);
    assert_eq!(session.transport.calls_to(REFRESH_PATH), 1);
    assert!(session.store.load().unwrap().is_none());
}

#[tokio::test]
async fn test_unauthorized_retry_is_not_retried_again() {
    let session = TestSession::logged_in("server").await;
    let mut events = session.manager.subscribe();
    session
        .transport
        .respond(ORDERS, 401, json!({ "detail": "Not allowed" }));
    session
        .transport
        .respond(REFRESH_PATH, 200, json!({ "access": REFRESHED_ACCESS }));
    let gateway = AuthGateway::for_session(session.manager.clone());

    let result = gateway.send(&ApiRequest::get(ORDERS)).await;

    assert!(matches!(result, Err(SessionError::SessionExpired)));
    assert_eq!(session.transport.calls_to(ORDERS), 2);
    assert_eq!(session.transport.calls_to(REFRESH_PATH), 1);
    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::TokenRefreshed,
            SessionEvent::ForcedLogout {
                reason: LogoutReason::Unauthorized
            },
        ]
    );
}

#[tokio::test]
async fn test_concurrent_unauthorized_requests_share_one_refresh() {
    let session = TestSession::logged_in("server").await;
    orders_require_refreshed_token(&session);
    session
        .transport
        .on_delayed(REFRESH_PATH, Duration::from_millis(50), |_, _| {
            ApiResponse::new(200, format!(r#"{{"access":"{}"}}"#, REFRESHED_ACCESS))
        });
    let gateway = AuthGateway::for_session(session.manager.clone());
    let request = ApiRequest::get(ORDERS);

    let (first, second) = tokio::join!(gateway.send(&request), gateway.send(&request));

    assert_eq!(first.unwrap().status, 200);
    assert_eq!(second.unwrap().status, 200);
    assert_eq!(session.transport.calls_to(REFRESH_PATH), 1);
    assert_eq!(session.transport.calls_to(ORDERS), 4);

    // A later 401 starts a fresh refresh rather than reusing the finished one
    session.transport.on(ORDERS, |_, bearer| {
        if bearer == Some("access-3") {
            ApiResponse::new(200, "[]")
        } else {
            ApiResponse::new(401, "")
        }
    });
    session
        .transport
        .respond(REFRESH_PATH, 200, json!({ "access": "access-3" }));
    assert_eq!(gateway.send(&request).await.unwrap().status, 200);
    assert_eq!(session.transport.calls_to(REFRESH_PATH), 2);
}

#[tokio::test]
async fn test_anonymous_unauthorized_is_not_authenticated() {
    let session = TestSession::new();
    session.transport.respond(ORDERS, 401, json!({}));
    let gateway = AuthGateway::for_session(session.manager.clone());

    let result = gateway.send(&ApiRequest::get(ORDERS)).await;

    assert!(matches!(result, Err(SessionError::NotAuthenticated)));
    assert_eq!(session.transport.bearers(ORDERS), vec![None]);
    assert_eq!(session.transport.calls_to(REFRESH_PATH), 0);
}

#[tokio::test]
async fn test_other_statuses_pass_through() {
    let session = TestSession::logged_in("manager").await;
    session
        .transport
        .respond(ORDERS, 500, json!({ "detail": "database unavailable" }));
    let gateway = AuthGateway::for_session(session.manager.clone());

    let response = gateway.send(&ApiRequest::get(ORDERS)).await.unwrap();
    assert_eq!(response.status, 500);

    let result: Result<Vec<Order>, _> = gateway.get_json(ORDERS).await;
    assert!(matches!(
        result,
        Err(SessionError::Server { status: 500, ref message }) if message == "database unavailable"
    ));
    assert!(session.manager.is_authenticated().await);
}

#[tokio::test]
async fn test_post_json_sends_body() {
    let session = TestSession::logged_in("server").await;
    session
        .transport
        .respond(ORDERS, 201, json!({ "id": 2, "table": "T9" }));
    let gateway = AuthGateway::for_session(session.manager.clone());

    let created: Order = gateway
        .post_json(ORDERS, &json!({ "table": "T9", "items": [3, 4] }))
        .await
        .unwrap();

    assert_eq!(created.id, 2);
    assert_eq!(
        session.transport.last_body(ORDERS),
        Some(json!({ "table": "T9", "items": [3, 4] }))
    );
}

#[tokio::test]
async fn test_transport_failure_is_network_error() {
    let session = TestSession::logged_in("server").await;
    session.transport.fail(ORDERS);
    let gateway = AuthGateway::for_session(session.manager.clone());

    let result = gateway.send(&ApiRequest::get(ORDERS)).await;

    assert!(matches!(result, Err(SessionError::Network { .. })));
    assert!(session.manager.is_authenticated().await);
}
