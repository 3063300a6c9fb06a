//! Tillguard Session - client-side session and authorization core
//!
//! Owns everything between "the operator typed a password" and "this button
//! is visible":
//!
//! - Credential storage of the single session record
//! - Role-based permission resolution for actions and menus
//! - The session state machine (login, refresh, extension, logout)
//! - Activity-driven session extension with throttling
//! - An auth gateway that attaches bearer tokens and recovers from one 401
//! - A periodic validator that checks the remote session
//!
//! ## Architecture
//!
//! - **Core** (tillguard-core): errors, configuration, logging, async helpers
//! - **Session** (this crate): the state machine and its collaborators
//! - **Presentation** (tillguard-cli, dashboard UI): thin adapters over [`SessionManager`]

pub mod api;
pub mod auth;
pub mod clock;
pub mod gateway;
pub mod session;

pub use api::{
    ApiRequest, ApiResponse, AuthApi, Method, ReqwestTransport, Transport, TransportError,
};
pub use auth::{MenuTable, Permission, PermissionResolver, PermissionSet, PermissionTable, Role, User};
pub use clock::{Clock, ManualClock, SystemClock};
pub use gateway::AuthGateway;
pub use session::{
    ActivitySignal, ActivityTracker, CredentialStore, FileBackend, LogoutReason, MemoryBackend,
    SessionEvent, SessionManager, SessionManagerBuilder, SessionRecord, SessionStatus,
    StorageBackend, TokenPair,
};

use tillguard_core::TillError;

/// Session-level error taxonomy.
///
/// Credential and transport failures are classified into these variants at
/// the session manager boundary; callers never see raw transport errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Validation error: {message}")]
    Validation { field: String, message: String },

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Session expired")]
    SessionExpired,

    #[error("Permission denied: {permission}")]
    Forbidden { permission: String },

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("A login is already in progress")]
    LoginInProgress,

    #[error("Login was cancelled")]
    LoginCancelled,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("{0}")]
    Storage(#[source] TillError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Core error: {0}")]
    Core(#[from] TillError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Create a validation error for a field
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a credential store error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        let message: String = message.into();
        Self::Storage(tillguard_core::storage_error!(message, "credential_store"))
    }

    /// Credential store error caused by `source`
    pub fn storage_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let message: String = message.into();
        Self::Storage(tillguard_core::storage_error!(message, "credential_store", source))
    }

    /// The infrastructure error behind this one, if any
    pub fn core_error(&self) -> Option<&TillError> {
        match self {
            SessionError::Storage(inner) | SessionError::Core(inner) => Some(inner),
            _ => None,
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a forbidden error for a permission
    pub fn forbidden(permission: Permission) -> Self {
        Self::Forbidden {
            permission: permission.to_string(),
        }
    }

    /// Message suitable for the notification toast
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Validation { message, .. } => message.clone(),
            SessionError::InvalidCredentials => "Invalid username or password.".to_string(),
            SessionError::AccountDisabled => {
                "This account has been disabled. Contact your manager.".to_string()
            }
            SessionError::Network { .. } | SessionError::Core(TillError::Timeout { .. }) => {
                "Could not reach the server. Check your connection and try again.".to_string()
            }
            SessionError::SessionExpired => {
                "Your session has expired. Please sign in again.".to_string()
            }
            SessionError::Forbidden { .. } => {
                "You do not have permission to do that.".to_string()
            }
            SessionError::NotAuthenticated => "Please sign in to continue.".to_string(),
            SessionError::LoginInProgress => "Signing in, please wait.".to_string(),
            SessionError::LoginCancelled => "Sign-in was cancelled.".to_string(),
            SessionError::Server { .. } => {
                "The server could not complete the request. Try again later.".to_string()
            }
            _ => "Something went wrong. Try again or restart the application.".to_string(),
        }
    }

    /// Whether retrying the same operation might succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Network { .. } | SessionError::LoginInProgress => true,
            SessionError::Server { status, .. } => *status >= 500,
            SessionError::Core(inner) => inner.is_recoverable(),
            _ => false,
        }
    }
}
