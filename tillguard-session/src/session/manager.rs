//! Session Manager - the session state machine
//!
//! `Anonymous -> Authenticating -> Authenticated -> (Expired) -> Anonymous`.
//!
//! The manager is the single owner of the session record. Every mutation
//! persists to the [`CredentialStore`] and updates in-memory state under the
//! same write lock, so the store never disagrees with what callers observe.

use super::{
    validator, ActivitySignal, ActivityTracker, CredentialStore, LogoutReason, SessionEvent,
    SessionRecord, SessionStatus, TokenPair,
};
use crate::api::{AuthApi, Endpoints, ReqwestTransport, Transport};
use crate::auth::{Permission, PermissionResolver, PermissionSet, Role, User};
use crate::clock::{Clock, SystemClock};
use crate::session::FileBackend;
use crate::{SessionError, SessionResult};
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tillguard_core::{
    log_operation_error, log_operation_start, log_operation_success, PeriodicTask,
    SessionSettings, TillConfig,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// One token refresh shared by every caller that hit a 401 meanwhile
struct RefreshFlight {
    id: u64,
    future: Shared<BoxFuture<'static, bool>>,
}

/// The login attempt allowed to commit. It stops counting once the future
/// driving it is dropped, since that drops the only strong handle.
#[derive(Debug)]
struct LoginAttempt {
    id: u64,
    alive: Weak<()>,
}

#[derive(Debug)]
pub(super) struct SessionState {
    /// `Some` exactly while authenticated
    pub(super) record: Option<SessionRecord>,
    login: Option<LoginAttempt>,
}

impl SessionState {
    fn login_in_progress(&self) -> bool {
        self.login
            .as_ref()
            .is_some_and(|attempt| attempt.alive.strong_count() > 0)
    }

    fn is_current_login(&self, id: u64) -> bool {
        self.login.as_ref().is_some_and(|attempt| attempt.id == id)
    }

    fn status_at(&self, now: DateTime<Utc>) -> SessionStatus {
        match self.record.as_ref() {
            Some(record) if record.is_usable_at(now) => SessionStatus::Authenticated,
            Some(_) => SessionStatus::Expired,
            None if self.login_in_progress() => SessionStatus::Authenticating,
            None => SessionStatus::Anonymous,
        }
    }
}

pub(super) struct SessionInner {
    pub(super) api: AuthApi,
    pub(super) store: CredentialStore,
    pub(super) resolver: PermissionResolver,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: SessionSettings,
    pub(super) fetch_permissions: bool,
    pub(super) state: RwLock<SessionState>,
    pub(super) tracker: ActivityTracker,
    pub(super) validator: Mutex<Option<PeriodicTask>>,
    refresh_flight: Mutex<Option<RefreshFlight>>,
    next_id: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

/// Handle to the session service. Clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    pub(super) inner: Arc<SessionInner>,
}

/// Builder for [`SessionManager`]
pub struct SessionManagerBuilder {
    api: AuthApi,
    store: Option<CredentialStore>,
    resolver: PermissionResolver,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    fetch_permissions: bool,
}

impl SessionManagerBuilder {
    pub fn new(api: AuthApi) -> Self {
        Self {
            api,
            store: None,
            resolver: PermissionResolver::default(),
            clock: Arc::new(SystemClock),
            settings: SessionSettings::default(),
            fetch_permissions: false,
        }
    }

    pub fn store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn resolver(mut self, resolver: PermissionResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn fetch_permissions(mut self, enabled: bool) -> Self {
        self.fetch_permissions = enabled;
        self
    }

    /// Build the manager in the anonymous state. Call
    /// [`SessionManager::restore`] to pick up a persisted session.
    pub fn build(self) -> SessionResult<SessionManager> {
        if self.settings.duration_ms == 0 {
            return Err(SessionError::config("Session duration must be greater than 0"));
        }

        let store = self
            .store
            .unwrap_or_else(|| CredentialStore::in_memory(&self.settings.storage_namespace));
        let (events, _) = broadcast::channel::<SessionEvent>(64);

        Ok(SessionManager {
            inner: Arc::new(SessionInner {
                api: self.api,
                store,
                resolver: self.resolver,
                clock: self.clock,
                tracker: ActivityTracker::new(self.settings.activity_throttle()),
                settings: self.settings,
                fetch_permissions: self.fetch_permissions,
                state: RwLock::new(SessionState {
                    record: None,
                    login: None,
                }),
                validator: Mutex::new(None),
                refresh_flight: Mutex::new(None),
                next_id: AtomicU64::new(1),
                events,
            }),
        })
    }
}

impl SessionManager {
    pub fn builder(api: AuthApi) -> SessionManagerBuilder {
        SessionManagerBuilder::new(api)
    }

    /// Wire a manager from configuration: reqwest transport, file-backed
    /// store and the configured permission overrides
    pub fn from_config(config: &TillConfig) -> SessionResult<Self> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config.api)?);
        let api = AuthApi::new(transport, Endpoints::from(&config.api));
        let backend = FileBackend::new(config.session.resolved_storage_dir())?;
        let store = CredentialStore::new(Arc::new(backend), &config.session.storage_namespace);

        SessionManagerBuilder::new(api)
            .store(store)
            .resolver(PermissionResolver::from_overrides(&config.permissions)?)
            .settings(config.session.clone())
            .fetch_permissions(config.api.fetch_permissions)
            .build()
    }

    pub fn api(&self) -> &AuthApi {
        &self.inner.api
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.inner.resolver
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Reconstruct the initial state from the credential store.
    ///
    /// A usable record becomes the live session; an expired or unreadable
    /// one is cleared.
    pub async fn restore(&self) -> SessionResult<SessionStatus> {
        let mut state = self.inner.state.write().await;
        if state.record.is_some() || state.login_in_progress() {
            return Ok(state.status_at(self.now()));
        }

        let loaded = match self.inner.store.load() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session record");
                self.inner.store.clear()?;
                None
            }
        };

        let Some(mut record) = loaded else {
            return Ok(SessionStatus::Anonymous);
        };

        if !record.is_usable_at(self.now()) {
            info!(username = %record.user.username, "Stored session has lapsed, clearing it");
            self.inner.store.clear()?;
            return Ok(SessionStatus::Anonymous);
        }

        // Grants follow the current permission table, not the one at login time
        record.permissions = self.inner.resolver.permissions_for(record.user.role);

        info!(
            username = %record.user.username,
            expires_at = %record.expires_at,
            "Restored session"
        );
        state.record = Some(record);
        self.inner.tracker.register();
        drop(state);

        self.start_validator();
        Ok(SessionStatus::Authenticated)
    }

    /// Sign in and attach the role's permission set.
    ///
    /// Dropping the returned future abandons the attempt; a `logout` while it
    /// is in flight makes it fail with [`SessionError::LoginCancelled`].
    pub async fn login(&self, username: &str, password: &str) -> SessionResult<User> {
        let username = username.trim().to_lowercase();
        if username.is_empty() {
            return Err(SessionError::validation("username", "Username is required"));
        }
        if password.is_empty() {
            return Err(SessionError::validation("password", "Password is required"));
        }

        // Held until this future completes or is dropped
        let alive = Arc::new(());
        let attempt = self.begin_login(&alive).await?;
        log_operation_start!("login", username = %username);

        let result = match self.authenticate(&username, password).await {
            Ok(record) => self.commit_login(attempt, record).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(user) => {
                log_operation_success!("login", username = %user.username, role = %user.role);
                self.emit(SessionEvent::LoggedIn {
                    username: user.username.clone(),
                });
                Ok(user)
            }
            Err(e) => {
                let mut state = self.inner.state.write().await;
                if state.is_current_login(attempt) {
                    state.login = None;
                }
                drop(state);

                log_operation_error!("login", e, username = %username);
                Err(e)
            }
        }
    }

    /// Claim the login slot for an attempt kept alive by `alive`
    async fn begin_login(&self, alive: &Arc<()>) -> SessionResult<u64> {
        let mut state = self.inner.state.write().await;

        if state.login_in_progress() {
            return Err(SessionError::LoginInProgress);
        }

        if state.record.is_some() {
            info!("Login requested while signed in, ending the current session");
            let (previous, cleared) = self.teardown(&mut state);
            if let Err(e) = cleared {
                error!(error = %e, "Failed to clear the previous session");
            }
            if let Some(user) = previous {
                self.emit(SessionEvent::LoggedOut {
                    username: user.username,
                });
            }
        }

        let id = self.next_id();
        state.login = Some(LoginAttempt {
            id,
            alive: Arc::downgrade(alive),
        });
        Ok(id)
    }

    /// Remote half of login: no local state is touched
    async fn authenticate(&self, username: &str, password: &str) -> SessionResult<SessionRecord> {
        let login = self.inner.api.login(username, password).await?;
        let tokens = TokenPair::new(login.tokens.access, login.tokens.refresh);
        let mut remote_user = login.user;

        if self.inner.fetch_permissions {
            match self.inner.api.permissions(&tokens.access).await {
                Ok(enrichment) => {
                    if let Some(role) = enrichment.role.filter(|r| !r.trim().is_empty()) {
                        debug!(%role, "Permissions endpoint supplied a role");
                        remote_user.role = Some(role);
                    }
                }
                Err(e) => warn!(error = %e, "Permission enrichment failed, using login role"),
            }
        }

        let user = remote_user.into_user()?;
        let permissions = self.inner.resolver.permissions_for(user.role);

        Ok(SessionRecord::new(
            user,
            tokens,
            permissions,
            self.now(),
            self.inner.settings.session_duration(),
        ))
    }

    async fn commit_login(&self, attempt: u64, record: SessionRecord) -> SessionResult<User> {
        let mut state = self.inner.state.write().await;

        // A logout during the remote call ends the attempt
        if !state.is_current_login(attempt) {
            debug!("Login attempt was superseded, discarding its tokens");
            return Err(SessionError::LoginCancelled);
        }

        self.inner.store.save(&record)?;

        let user = record.user.clone();
        state.login = None;
        state.record = Some(record);
        self.inner.tracker.register();
        drop(state);

        self.start_validator();
        Ok(user)
    }

    /// Best-effort remote logout followed by unconditional local cleanup
    pub async fn logout(&self) -> SessionResult<()> {
        let tokens = {
            let state = self.inner.state.read().await;
            state.record.as_ref().map(|r| r.tokens.clone())
        };

        if let Some(tokens) = tokens.filter(|t| t.has_refresh()) {
            let access = tokens.has_access().then_some(tokens.access.as_str());
            if let Err(e) = self.inner.api.logout(&tokens.refresh, access).await {
                warn!(error = %e, "Remote logout failed, clearing the local session anyway");
            }
        }

        let mut state = self.inner.state.write().await;
        let (previous, cleared) = self.teardown(&mut state);
        drop(state);

        if let Some(user) = previous {
            info!(username = %user.username, "Logged out");
            self.emit(SessionEvent::LoggedOut {
                username: user.username,
            });
        }

        cleared.inspect_err(|e| error!(error = %e, "Failed to clear credential store on logout"))
    }

    /// Local-only teardown. Returns `true` if a session was actually ended;
    /// calling it on an anonymous manager is a no-op.
    pub async fn force_logout(&self, reason: LogoutReason) -> SessionResult<bool> {
        self.end_session_if(reason, |_| true).await
    }

    /// Force logout only if the live record matches `condition` once the
    /// write lock is held
    pub(crate) async fn end_session_if(
        &self,
        reason: LogoutReason,
        condition: impl FnOnce(&SessionRecord) -> bool,
    ) -> SessionResult<bool> {
        let mut state = self.inner.state.write().await;
        if !state.record.as_ref().is_some_and(condition) {
            return Ok(false);
        }

        let (previous, cleared) = self.teardown(&mut state);
        drop(state);

        let username = previous.map(|u| u.username).unwrap_or_default();
        match reason {
            LogoutReason::Requested => info!(%username, %reason, "Session ended locally"),
            _ => error!(%username, %reason, "Forced logout"),
        }
        self.emit(SessionEvent::ForcedLogout { reason });

        cleared
            .map(|_| true)
            .inspect_err(|e| error!(error = %e, "Failed to clear credential store on forced logout"))
    }

    /// Tear down the session if it has lapsed
    async fn expire_if_lapsed(&self) -> SessionResult<bool> {
        let now = self.now();
        self.end_session_if(LogoutReason::Expired, |r| !r.is_usable_at(now))
            .await
    }

    /// Store clear plus in-memory transition; the caller holds the write lock.
    /// Also cancels a pending login and detaches any in-flight refresh.
    fn teardown(&self, state: &mut SessionState) -> (Option<User>, SessionResult<()>) {
        let previous = state.record.take().map(|r| r.user);
        let cleared = self.inner.store.clear();
        state.login = None;
        self.clear_refresh_flight(None);

        self.inner.tracker.deregister();
        self.stop_validator();

        (previous, cleared)
    }

    pub fn is_session_expired(&self, record: &SessionRecord) -> bool {
        record.is_expired_at(self.now())
    }

    /// Push the expiry to `now + duration`. Returns the new expiry.
    pub async fn extend_session(&self) -> SessionResult<DateTime<Utc>> {
        let now = self.now();
        let mut state = self.inner.state.write().await;

        let Some(current) = state.record.as_ref() else {
            return Err(SessionError::NotAuthenticated);
        };

        if current.is_expired_at(now) {
            drop(state);
            self.expire_if_lapsed().await?;
            return Err(SessionError::SessionExpired);
        }

        let mut updated = current.clone();
        updated.extend(now, self.inner.settings.session_duration());
        self.inner.store.save(&updated)?;

        let expires_at = updated.expires_at;
        state.record = Some(updated);
        drop(state);

        debug!(%expires_at, "Session extended");
        self.emit(SessionEvent::Extended { expires_at });
        Ok(expires_at)
    }

    /// Feed an interaction signal. Returns `true` if it extended the session.
    pub async fn record_activity(&self, signal: ActivitySignal) -> SessionResult<bool> {
        if !self.inner.tracker.should_extend(signal, self.now()) {
            return Ok(false);
        }

        self.extend_session().await.map(|_| true)
    }

    pub fn is_tracking_activity(&self) -> bool {
        self.inner.tracker.is_registered()
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent callers share one in-flight exchange. On failure the
    /// session is force-logged-out and `false` is returned. A result that
    /// arrives after the session ended is dropped and also reports `false`.
    pub async fn refresh(&self) -> bool {
        let future = {
            let mut slot = self
                .inner
                .refresh_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            match slot.as_ref() {
                Some(flight) => {
                    debug!("Joining in-flight token refresh");
                    flight.future.clone()
                }
                None => {
                    let id = self.next_id();
                    let manager = self.clone();
                    let future = async move {
                        let refreshed = manager.run_refresh().await;
                        manager.clear_refresh_flight(Some(id));
                        refreshed
                    }
                    .boxed()
                    .shared();
                    *slot = Some(RefreshFlight {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };

        future.await
    }

    /// Empty the refresh slot, or only if it still holds flight `id`
    fn clear_refresh_flight(&self, id: Option<u64>) {
        let mut slot = self
            .inner
            .refresh_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if id.is_none() || slot.as_ref().map(|f| f.id) == id {
            slot.take();
        }
    }

    async fn run_refresh(&self) -> bool {
        let refresh_token = {
            let state = self.inner.state.read().await;
            state
                .record
                .as_ref()
                .map(|r| r.tokens.refresh.clone())
                .filter(|t| !t.is_empty())
        };

        let Some(refresh_token) = refresh_token else {
            warn!("No refresh token available");
            let _ = self
                .end_session_if(LogoutReason::RefreshFailed, |r| !r.tokens.has_refresh())
                .await;
            return false;
        };

        // Everything below applies only to the session that owns this token
        let issued_for = |r: &SessionRecord| r.tokens.refresh == refresh_token;

        log_operation_start!("token_refresh");

        let access = match self.inner.api.refresh(&refresh_token).await {
            Ok(access) => access,
            Err(e) => {
                log_operation_error!("token_refresh", e);
                let _ = self
                    .end_session_if(LogoutReason::RefreshFailed, issued_for)
                    .await;
                return false;
            }
        };

        let mut state = self.inner.state.write().await;
        let Some(current) = state.record.as_ref().filter(|r| issued_for(*r)) else {
            debug!("Session changed while refreshing, dropping the new token");
            return false;
        };

        let mut updated = current.clone();
        updated.tokens.access = access;

        if let Err(e) = self.inner.store.save(&updated) {
            drop(state);
            log_operation_error!("token_refresh", e);
            let _ = self
                .end_session_if(LogoutReason::RefreshFailed, issued_for)
                .await;
            return false;
        }

        state.record = Some(updated);
        drop(state);

        log_operation_success!("token_refresh");
        self.emit(SessionEvent::TokenRefreshed);
        true
    }

    /// Run `f` against the live record. A lapsed record is torn down and
    /// yields `None`, exactly like no session at all.
    async fn with_live_record<R>(&self, f: impl FnOnce(&SessionRecord) -> R) -> Option<R> {
        {
            let state = self.inner.state.read().await;
            match state.record.as_ref() {
                None => return None,
                Some(record) if record.is_usable_at(self.now()) => return Some(f(record)),
                Some(_) => {}
            }
        }

        if let Err(e) = self.expire_if_lapsed().await {
            error!(error = %e, "Cleanup of expired session failed");
        }
        None
    }

    async fn current_role(&self) -> Option<Role> {
        self.with_live_record(|r| r.user.role).await
    }

    pub async fn has_permission(&self, permission: Permission) -> bool {
        self.current_role()
            .await
            .is_some_and(|role| self.inner.resolver.has_permission(role, permission))
    }

    pub async fn has_any_permission(&self, permissions: &[Permission]) -> bool {
        self.current_role()
            .await
            .is_some_and(|role| self.inner.resolver.has_any_permission(role, permissions))
    }

    pub async fn has_all_permissions(&self, permissions: &[Permission]) -> bool {
        self.current_role()
            .await
            .is_some_and(|role| self.inner.resolver.has_all_permissions(role, permissions))
    }

    pub async fn can_access_menu(&self, menu_id: &str) -> bool {
        self.current_role()
            .await
            .is_some_and(|role| self.inner.resolver.can_access_menu(role, menu_id))
    }

    /// Menus the signed-in user may open; empty when anonymous
    pub async fn accessible_menus(&self) -> Vec<String> {
        match self.current_role().await {
            Some(role) => self.inner.resolver.accessible_menus(role),
            None => Vec::new(),
        }
    }

    pub async fn is_admin(&self) -> bool {
        self.current_role().await == Some(Role::Administrator)
    }

    pub async fn is_manager(&self) -> bool {
        self.current_role().await == Some(Role::Manager)
    }

    pub async fn is_server(&self) -> bool {
        self.current_role().await == Some(Role::Server)
    }

    pub async fn is_cashier(&self) -> bool {
        self.current_role().await == Some(Role::Cashier)
    }

    /// Like [`has_permission`](Self::has_permission), as a `Result`
    pub async fn require_permission(&self, permission: Permission) -> SessionResult<()> {
        let had_session = self.inner.state.read().await.record.is_some();

        match self.current_role().await {
            Some(role) if self.inner.resolver.has_permission(role, permission) => Ok(()),
            Some(_) => Err(SessionError::forbidden(permission)),
            None if had_session => Err(SessionError::SessionExpired),
            None => Err(SessionError::NotAuthenticated),
        }
    }

    /// Current state. A lapsed session that has not been torn down yet is
    /// reported as [`SessionStatus::Expired`].
    pub async fn status(&self) -> SessionStatus {
        self.inner.state.read().await.status_at(self.now())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.with_live_record(|_| true).await.unwrap_or(false)
    }

    pub async fn current_user(&self) -> Option<User> {
        self.with_live_record(|r| r.user.clone()).await
    }

    pub async fn permissions(&self) -> PermissionSet {
        self.with_live_record(|r| r.permissions.clone())
            .await
            .unwrap_or_default()
    }

    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.with_live_record(|r| r.expires_at).await
    }

    pub async fn time_remaining(&self) -> Option<Duration> {
        let now = self.now();
        self.with_live_record(|r| r.time_remaining(now)).await
    }

    /// Bearer credential for outbound requests; not for UI code
    pub async fn access_token(&self) -> Option<String> {
        self.with_live_record(|r| r.tokens.access.clone()).await
    }

    fn start_validator(&self) {
        let task = validator::spawn(&self.inner);
        let mut slot = self
            .inner
            .validator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(mut previous) = slot.take() {
            previous.cancel();
        }
        *slot = task;
    }

    fn stop_validator(&self) {
        let task = self
            .inner
            .validator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut task) = task {
            if task.cancel() {
                debug!(task = task.name(), "Stopped session validator");
            }
        }
    }

    /// Whether the periodic validator is currently scheduled
    pub fn is_validator_running(&self) -> bool {
        self.inner
            .validator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_cancelled())
    }
}
