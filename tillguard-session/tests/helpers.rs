//! Integration test helpers
//!
//! A scripted in-memory transport, fixture payloads and a ready-made
//! session manager wired to a manual clock.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tillguard_core::SessionSettings;
use tillguard_session::{
    ApiRequest, ApiResponse, AuthApi, Clock, CredentialStore, ManualClock, Method,
    SessionEvent, SessionManager, Transport, TransportError,
};
use tokio::sync::broadcast;

pub const ACCESS: &str = "access-1";
pub const REFRESHED_ACCESS: &str = "access-2";
pub const REFRESH: &str = "refresh-1";
pub const PASSWORD: &str = "correct-pw";

pub const LOGIN: &str = "login";
pub const REFRESH_PATH: &str = "token/refresh";
pub const PROFILE: &str = "profile";
pub const LOGOUT: &str = "logout";
pub const PERMISSIONS: &str = "permissions";

static TRACING: LazyLock<()> = LazyLock::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(std::io::sink)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    }
});

pub fn init_tracing() {
    LazyLock::force(&TRACING);
}

type Handler =
    Arc<dyn Fn(&ApiRequest, Option<&str>) -> Result<ApiResponse, TransportError> + Send + Sync>;

#[derive(Clone)]
struct Route {
    handler: Handler,
    delay: Option<Duration>,
}

/// A request as the mock transport saw it
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

/// Transport answering from per-path handlers and recording every call
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn route(&self, path: &str, handler: Handler, delay: Option<Duration>) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Route { handler, delay });
    }

    pub fn on<F>(&self, path: &str, handler: F)
    where
        F: Fn(&ApiRequest, Option<&str>) -> ApiResponse + Send + Sync + 'static,
    {
        self.route(path, Arc::new(move |req, bearer| Ok(handler(req, bearer))), None);
    }

    /// Like [`on`](Self::on), but the response is held back for `delay`
    pub fn on_delayed<F>(&self, path: &str, delay: Duration, handler: F)
    where
        F: Fn(&ApiRequest, Option<&str>) -> ApiResponse + Send + Sync + 'static,
    {
        self.route(
            path,
            Arc::new(move |req, bearer| Ok(handler(req, bearer))),
            Some(delay),
        );
    }

    /// Always answer `status` with a JSON body
    pub fn respond(&self, path: &str, status: u16, body: Value) {
        let body = body.to_string();
        self.on(path, move |_, _| ApiResponse::new(status, body.clone()));
    }

    /// Fail every call to `path` at the transport level
    pub fn fail(&self, path: &str) {
        self.route(
            path,
            Arc::new(|_, _| Err(TransportError::Connection("connection refused".to_string()))),
            None,
        );
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.path == path).count()
    }

    pub fn bearers(&self, path: &str) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == path)
            .map(|c| c.bearer)
            .collect()
    }

    pub fn last_body(&self, path: &str) -> Option<Value> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == path)
            .last()
            .and_then(|c| c.body)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method,
            path: request.path.clone(),
            bearer: bearer.map(str::to_string),
            body: request.body.clone(),
        });

        let route = self.routes.lock().unwrap().get(&request.path).cloned();
        let Some(route) = route else {
            return Ok(ApiResponse::new(404, r#"{"detail":"Not found"}"#));
        };

        if let Some(delay) = route.delay {
            tokio::time::sleep(delay).await;
        }

        (route.handler)(request, bearer)
    }
}

/// Body of a successful `POST login`
pub fn login_body(username: &str, role: &str) -> Value {
    json!({
        "tokens": { "access": ACCESS, "refresh": REFRESH },
        "user": {
            "id": 7,
            "username": username,
            "email": format!("{}@example.com", username),
            "first_name": "Alice",
            "last_name": "Liddell",
            "role": role,
            "is_active": true,
            "is_staff": false,
            "is_superuser": false,
            "date_joined": "2024-03-01T09:30:00Z"
        }
    })
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Manager, transport, clock and store wired together
pub struct TestSession {
    pub transport: Arc<MockTransport>,
    pub clock: ManualClock,
    pub store: CredentialStore,
    pub manager: SessionManager,
}

impl TestSession {
    pub fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    pub fn with_settings(settings: SessionSettings) -> Self {
        Self::build(settings, false)
    }

    pub fn build(settings: SessionSettings, fetch_permissions: bool) -> Self {
        init_tracing();

        let transport = MockTransport::new();
        let clock = ManualClock::new(start_time());
        let store = CredentialStore::in_memory(&settings.storage_namespace);
        let api = AuthApi::new(transport.clone(), Default::default());

        let manager = SessionManager::builder(api)
            .store(store.clone())
            .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
            .settings(settings)
            .fetch_permissions(fetch_permissions)
            .build()
            .unwrap();

        Self {
            transport,
            clock,
            store,
            manager,
        }
    }

    /// Script the happy-path auth endpoints
    pub fn with_auth_routes(self, role: &str) -> Self {
        let body = login_body("alice", role).to_string();
        self.transport.on(LOGIN, move |req, _| {
            let password = req
                .body
                .as_ref()
                .and_then(|b| b.get("password"))
                .and_then(Value::as_str);
            if password == Some(PASSWORD) {
                ApiResponse::new(200, body.clone())
            } else {
                ApiResponse::new(401, r#"{"detail":"Invalid credentials"}"#)
            }
        });
        self.transport.respond(PROFILE, 200, json!({ "id": 7 }));
        self.transport.respond(LOGOUT, 200, json!({}));
        self
    }

    /// Scripted routes plus a completed login as `Alice`
    pub async fn logged_in(role: &str) -> Self {
        let session = Self::new().with_auth_routes(role);
        session.manager.login("Alice", PASSWORD).await.unwrap();
        session
    }
}

/// Drain every event currently buffered on `rx`
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Let spawned tasks run after a paused-clock advance
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
