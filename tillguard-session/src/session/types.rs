//! Session Types and Structures

use crate::auth::{PermissionSet, User};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access + refresh credential pair
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Short-lived bearer credential
    pub access: String,
    /// Longer-lived credential used only to mint a new access token
    pub refresh: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }

    pub fn has_access(&self) -> bool {
        !self.access.is_empty()
    }

    pub fn has_refresh(&self) -> bool {
        !self.refresh.is_empty()
    }
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

/// The persisted unit: who is signed in, with which tokens, until when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user: User,
    pub tokens: TokenPair,
    pub permissions: PermissionSet,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    /// Fresh record with `last_activity = now` and `expires_at = now + duration`
    pub fn new(
        user: User,
        tokens: TokenPair,
        permissions: PermissionSet,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            user,
            tokens,
            permissions,
            expires_at: now + duration,
            last_activity: now,
        }
    }

    /// Strictly after the expiry instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Record the manager may treat as a live session
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.tokens.has_access() && !self.is_expired_at(now)
    }

    /// Move the activity mark to `now` and recompute the expiry
    pub fn extend(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.last_activity = now;
        self.expires_at = now + duration;
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Observable state of the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Anonymous,
    Authenticating,
    Authenticated,
    /// Transient; reported only while a lapsed session is being torn down
    Expired,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Anonymous => write!(f, "anonymous"),
            SessionStatus::Authenticating => write!(f, "authenticating"),
            SessionStatus::Authenticated => write!(f, "authenticated"),
            SessionStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Why a session ended without the user asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    /// Local expiry detected
    Expired,
    /// Refresh token rejected or refresh failed
    RefreshFailed,
    /// Remote validity check failed
    ValidationFailed,
    /// A retried request was still unauthorized
    Unauthorized,
    /// Caller requested a local-only logout
    Requested,
}

impl LogoutReason {
    /// Notice shown to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            LogoutReason::Requested => "You have been signed out.",
            _ => "Your session has expired. Please sign in again.",
        }
    }
}

impl std::fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogoutReason::Expired => write!(f, "expired"),
            LogoutReason::RefreshFailed => write!(f, "refresh_failed"),
            LogoutReason::ValidationFailed => write!(f, "validation_failed"),
            LogoutReason::Unauthorized => write!(f, "unauthorized"),
            LogoutReason::Requested => write!(f, "requested"),
        }
    }
}

/// Lifecycle events published to subscribers such as the notification UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { username: String },
    LoggedOut { username: String },
    Extended { expires_at: DateTime<Utc> },
    TokenRefreshed,
    ForcedLogout { reason: LogoutReason },
}
