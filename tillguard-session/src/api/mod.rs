//! Remote authentication API contracts
//!
//! Encodes login, permissions, token refresh, profile and logout on top of a
//! [`Transport`], and classifies their HTTP outcomes into [`SessionError`]s.

use crate::auth::{Role, User};
use crate::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tillguard_core::ApiSettings;
use tracing::{debug, warn};

pub mod transport;

pub use transport::{ApiRequest, ApiResponse, Method, ReqwestTransport, Transport, TransportError};

/// Token pair as returned by the login contract
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTokens {
    pub access: String,
    pub refresh: String,
}

/// User payload of the login contract
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteUser {
    pub id: serde_json::Value,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub date_joined: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RemoteUser {
    /// Map the remote role onto the closed [`Role`] set.
    ///
    /// Superusers are administrators whatever their role string says.
    pub fn resolve_role(&self) -> SessionResult<Role> {
        if self.is_superuser {
            return Ok(Role::Administrator);
        }

        match self.role.as_deref() {
            Some(role) => role.parse().map_err(SessionError::protocol),
            None => Err(SessionError::protocol(format!(
                "User '{}' has no role",
                self.username
            ))),
        }
    }

    pub fn into_user(self) -> SessionResult<User> {
        let role = self.resolve_role()?;

        let id = match &self.id {
            serde_json::Value::String(id) => id.clone(),
            serde_json::Value::Number(id) => id.to_string(),
            other => {
                return Err(SessionError::protocol(format!(
                    "Unsupported user id: {}",
                    other
                )))
            }
        };

        let username = self.username.trim().to_lowercase();
        let display_name = User::derive_display_name(&self.first_name, &self.last_name, &username);
        let date_joined = self
            .date_joined
            .as_deref()
            .and_then(|raw| raw.parse::<chrono::DateTime<chrono::Utc>>().ok());

        Ok(User {
            id,
            username,
            display_name,
            email: self.email.filter(|e| !e.is_empty()),
            first_name: self.first_name,
            last_name: self.last_name,
            role,
            is_active: self.is_active,
            is_staff: self.is_staff,
            is_superuser: self.is_superuser,
            date_joined,
        })
    }
}

/// `POST login` response
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub tokens: RemoteTokens,
    pub user: RemoteUser,
}

/// `GET permissions` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermissionsResponse {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
}

/// Endpoint paths, relative to the transport's base URL
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub login: String,
    pub refresh: String,
    pub profile: String,
    pub logout: String,
    pub permissions: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::from(&ApiSettings::default())
    }
}

impl From<&ApiSettings> for Endpoints {
    fn from(settings: &ApiSettings) -> Self {
        Self {
            login: settings.login_path.clone(),
            refresh: settings.refresh_path.clone(),
            profile: settings.profile_path.clone(),
            logout: settings.logout_path.clone(),
            permissions: settings.permissions_path.clone(),
        }
    }
}

/// Client for the authentication contracts
#[derive(Clone)]
pub struct AuthApi {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
}

impl AuthApi {
    pub fn new(transport: Arc<dyn Transport>, endpoints: Endpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// `POST login`
    pub async fn login(&self, username: &str, password: &str) -> SessionResult<LoginResponse> {
        let body = serde_json::to_value(LoginRequest { username, password })?;
        let request = ApiRequest::post(&self.endpoints.login, body);

        let response = self.transport.execute(&request, None).await?;
        if !response.is_success() {
            return Err(classify_login_failure(&response));
        }

        let login: LoginResponse = response.json()?;
        if login.tokens.access.is_empty() || login.tokens.refresh.is_empty() {
            return Err(SessionError::protocol("Login response is missing tokens"));
        }
        if !login.user.is_active {
            return Err(SessionError::AccountDisabled);
        }

        debug!(username = %login.user.username, "Login accepted by server");
        Ok(login)
    }

    /// `GET permissions`
    pub async fn permissions(&self, access_token: &str) -> SessionResult<PermissionsResponse> {
        let request = ApiRequest::get(&self.endpoints.permissions);
        let response = self.transport.execute(&request, Some(access_token)).await?;

        if !response.is_success() {
            return Err(SessionError::Server {
                status: response.status,
                message: response.error_message(),
            });
        }

        response.json()
    }

    /// `POST token/refresh`, returns the new access token
    pub async fn refresh(&self, refresh_token: &str) -> SessionResult<String> {
        let request = ApiRequest::post(&self.endpoints.refresh, json!({ "refresh": refresh_token }));
        let response = self.transport.execute(&request, None).await?;

        match response.status {
            200..=299 => {
                let refreshed: RefreshResponse = response.json()?;
                if refreshed.access.is_empty() {
                    return Err(SessionError::protocol("Refresh response has an empty token"));
                }
                Ok(refreshed.access)
            }
            400 | 401 | 403 => Err(SessionError::SessionExpired),
            status => Err(SessionError::Server {
                status,
                message: response.error_message(),
            }),
        }
    }

    /// `GET profile` as a validity check; any non-2xx means the session is invalid
    pub async fn profile(&self, access_token: &str) -> SessionResult<()> {
        let request = ApiRequest::get(&self.endpoints.profile);
        let response = self.transport.execute(&request, Some(access_token)).await?;

        if response.is_success() {
            Ok(())
        } else {
            debug!(status = response.status, "Profile check rejected");
            Err(SessionError::SessionExpired)
        }
    }

    /// `POST logout`; callers treat failures as best-effort
    pub async fn logout(&self, refresh_token: &str, access_token: Option<&str>) -> SessionResult<()> {
        let request = ApiRequest::post(&self.endpoints.logout, json!({ "refresh": refresh_token }));
        let response = self.transport.execute(&request, access_token).await?;

        if !response.is_success() {
            warn!(status = response.status, "Server rejected logout");
            return Err(SessionError::Server {
                status: response.status,
                message: response.error_message(),
            });
        }

        Ok(())
    }
}

/// Map a rejected login to the error taxonomy
pub fn classify_login_failure(response: &ApiResponse) -> SessionError {
    let message = response.error_message();
    let lowered = message.to_lowercase();
    let mentions_disabled = lowered.contains("inactive") || lowered.contains("disabled");

    match response.status {
        403 => SessionError::AccountDisabled,
        400 | 401 if mentions_disabled => SessionError::AccountDisabled,
        400 | 401 => SessionError::InvalidCredentials,
        status => SessionError::Server { status, message },
    }
}
