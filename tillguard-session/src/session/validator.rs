//! Periodic session validator
//!
//! While authenticated, calls `GET profile` on a fixed interval and forces a
//! logout on any failure. The task only holds a weak reference to the
//! manager and is cancelled whenever the session ends.

use super::manager::SessionInner;
use super::{LogoutReason, SessionManager};
use std::sync::Arc;
use tillguard_core::{PeriodicTask, TickOutcome};
use tracing::{debug, warn};

/// Spawn the validator for `inner`, or `None` when validation is disabled
pub(super) fn spawn(inner: &Arc<SessionInner>) -> Option<PeriodicTask> {
    let period = inner.settings.validation_interval()?;
    let weak = Arc::downgrade(inner);

    Some(PeriodicTask::spawn("session-validator", period, move || {
        let weak = weak.clone();
        async move {
            let Some(inner) = weak.upgrade() else {
                return TickOutcome::Stop;
            };

            if (SessionManager { inner }).validate().await {
                TickOutcome::Continue
            } else {
                TickOutcome::Stop
            }
        }
    }))
}

impl SessionManager {
    /// One validation pass: local expiry first, then the remote check.
    ///
    /// Returns `true` if the session is still valid. Any failure ends the
    /// session with a forced logout.
    pub async fn validate(&self) -> bool {
        let now = self.now();
        let current = {
            let state = self.inner.state.read().await;
            match state.record.as_ref() {
                None => return false,
                Some(record) => record
                    .is_usable_at(now)
                    .then(|| record.tokens.access.clone()),
            }
        };

        let Some(access_token) = current else {
            let _ = self.force_logout(LogoutReason::Expired).await;
            return false;
        };

        match self.inner.api.profile(&access_token).await {
            Ok(()) => {
                debug!("Session validated");
                true
            }
            Err(e) => {
                warn!(error = %e, "Session validation failed");
                let _ = self.force_logout(LogoutReason::ValidationFailed).await;
                false
            }
        }
    }
}
