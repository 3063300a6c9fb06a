//! Auth Gateway - bearer attachment and single-retry 401 recovery
//!
//! Every outbound dashboard request goes through [`AuthGateway::send`]. A
//! 401 triggers at most one token refresh and at most one retry.

use crate::api::{ApiRequest, ApiResponse, Transport};
use crate::session::{LogoutReason, SessionManager, SessionRecord};
use crate::{SessionError, SessionResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AuthGateway {
    transport: Arc<dyn Transport>,
    session: SessionManager,
}

impl AuthGateway {
    pub fn new(transport: Arc<dyn Transport>, session: SessionManager) -> Self {
        Self { transport, session }
    }

    /// Gateway sharing the session manager's transport
    pub fn for_session(session: SessionManager) -> Self {
        Self::new(session.api().transport(), session)
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Send a request with the current bearer token.
    ///
    /// Non-401 responses come back unchanged, including other error statuses.
    pub async fn send(&self, request: &ApiRequest) -> SessionResult<ApiResponse> {
        let bearer = self.bearer().await?;
        let response = self.transport.execute(request, bearer.as_deref()).await?;

        if !response.is_unauthorized() {
            return Ok(response);
        }

        debug!(method = %request.method, path = %request.path, "Request unauthorized");

        if self.session.store().refresh_token()?.is_none() {
            return match self.end_session_for(bearer.as_deref()).await {
                Ok(false) => Err(SessionError::NotAuthenticated),
                _ => Err(SessionError::SessionExpired),
            };
        }

        // A failed refresh has already forced the logout
        if !self.session.refresh().await {
            return Err(SessionError::SessionExpired);
        }

        let bearer = self.bearer().await?;
        let retried = self.transport.execute(request, bearer.as_deref()).await?;

        if retried.is_unauthorized() {
            warn!(path = %request.path, "Still unauthorized after token refresh");
            let _ = self.end_session_for(bearer.as_deref()).await;
            return Err(SessionError::SessionExpired);
        }

        Ok(retried)
    }

    /// Access token of the live session, read from the store's raw entry
    async fn bearer(&self) -> SessionResult<Option<String>> {
        if !self.session.is_authenticated().await {
            return Ok(None);
        }
        self.session.store().access_token()
    }

    /// Force logout, but only of the session that sent `bearer`
    async fn end_session_for(&self, bearer: Option<&str>) -> SessionResult<bool> {
        self.session
            .end_session_if(LogoutReason::Unauthorized, |record: &SessionRecord| {
                bearer == Some(record.tokens.access.as_str())
            })
            .await
    }

    /// `GET` and decode a 2xx JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SessionResult<T> {
        self.send_json(ApiRequest::get(path)).await
    }

    /// `POST` a JSON body and decode a 2xx JSON response
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> SessionResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)?;
        self.send_json(ApiRequest::post(path, body)).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> SessionResult<T> {
        let response = self.send(&request).await?;

        if !response.is_success() {
            return Err(SessionError::Server {
                status: response.status,
                message: response.error_message(),
            });
        }

        response.json()
    }
}
