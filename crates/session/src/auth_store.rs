//! Auth store: the single owner of the current session.
//!
//! State machine: `Unauthenticated → Checking → Authenticated ⇄ Refreshing`.
//! Reads go through a lock-free [`ArcSwap`] snapshot. Every write of the
//! durable snapshot and the in-memory state happens inside one commit
//! section, so no reader sees one advanced without the other.
//!
//! Refreshes are single-flight: callers that queue behind a running refresh
//! get its result instead of rotating the token a second time.

use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use sweat24_protocol::{new_id, Id, LoginRequest, Role, User};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::AuthBackend;
use crate::config::SessionConfig;
use crate::error::{ApiError, AuthError, ErrorKind};
use crate::events::{EventSender, LogoutReason, SessionEvent};
use crate::storage::{BroadcastRecord, SessionStorage, StoredSession};
use crate::token;

const LOGIN_FAILED: &str = "Login failed. Please check your email and password.";
const INVALID_LOGIN_RESPONSE: &str = "Unexpected response from the server. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStatus {
    #[default]
    Unauthenticated,
    Checking,
    Authenticated,
    Refreshing,
}

/// The signed-in identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Id,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    /// `None` when the token is opaque
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Build from a token and user. Token claims win over `issued_at` when present.
    pub fn new(token: &str, user: &User, issued_at: DateTime<Utc>) -> Self {
        let claims = token::decode(token).ok();
        Self {
            user_id: user.id.clone(),
            display_name: user.name.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            issued_at: claims
                .as_ref()
                .and_then(|c| c.issued_at())
                .unwrap_or(issued_at),
            expires_at: claims.and_then(|c| c.expires_at()),
        }
    }

    pub fn has_role(&self, role: &Role) -> bool {
        &self.role == role
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Point-in-time view of the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthSnapshot {
    pub status: AuthStatus,
    pub session: Option<Session>,
    pub token: Option<String>,
    pub user: Option<User>,
    /// Issue time of the persisted snapshot backing this session
    pub persisted_at: Option<DateTime<Utc>>,
    /// Last login error, for inline display next to the form
    pub error: Option<String>,
}

impl AuthSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.status == AuthStatus::Authenticated && self.token.is_some()
    }

    fn with_status(&self, status: AuthStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    fn signed_out(error: Option<String>) -> Self {
        Self {
            error,
            ..Self::default()
        }
    }
}

pub struct AuthStore {
    id: String,
    config: SessionConfig,
    backend: Arc<dyn AuthBackend>,
    storage: Arc<dyn SessionStorage>,
    snapshot: ArcSwap<AuthSnapshot>,
    status_tx: watch::Sender<AuthStatus>,
    events: EventSender,
    commit_lock: Mutex<()>,
    refresh_gate: tokio::sync::Mutex<()>,
    auto_refresh: Mutex<Option<JoinHandle<()>>>,
}

impl AuthStore {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn AuthBackend>,
        storage: Arc<dyn SessionStorage>,
        events: EventSender,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(AuthStatus::Unauthenticated);
        Arc::new(Self {
            id: new_id(),
            config,
            backend,
            storage,
            snapshot: ArcSwap::from_pointee(AuthSnapshot::default()),
            status_tx,
            events,
            commit_lock: Mutex::new(()),
            refresh_gate: tokio::sync::Mutex::new(()),
            auto_refresh: Mutex::new(None),
        })
    }

    /// Id written into broadcast records as their origin.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<AuthSnapshot> {
        self.snapshot.load_full()
    }

    pub fn status(&self) -> AuthStatus {
        self.snapshot.load().status
    }

    pub fn token(&self) -> Option<String> {
        self.snapshot.load().token.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.snapshot.load().session.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AuthStatus> {
        self.status_tx.subscribe()
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Restore a persisted session, verifying or refreshing it.
    pub async fn initialize(self: &Arc<Self>) -> AuthStatus {
        self.set_status(AuthStatus::Checking);

        let stored = match self.storage.load() {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                debug!(
                    component = "auth_store",
                    event = "auth.init.no_snapshot",
                    "No persisted session"
                );
                self.clear_session(None);
                return AuthStatus::Unauthenticated;
            }
            Err(e) => {
                warn!(
                    component = "auth_store",
                    event = "auth.init.snapshot_unreadable",
                    error = %e,
                    "Persisted session unreadable, discarding"
                );
                self.clear_session(None);
                return AuthStatus::Unauthenticated;
            }
        };

        self.adopt_stored(&stored);

        let stale = stored.is_stale(Utc::now(), self.config.stale_after);
        let expired = token::decode(&stored.token)
            .ok()
            .and_then(|claims| claims.exp())
            .is_some_and(|exp| token::now_millis() >= exp.saturating_mul(1000));

        if stale || expired {
            info!(
                component = "auth_store",
                event = "auth.init.refreshing",
                stale,
                expired,
                "Persisted session needs rotation"
            );
            return self.recover_with_refresh().await;
        }

        match self.backend.identity(&stored.token).await {
            Ok(user) => match self.commit_session(&stored.token, user, stored.issued_at) {
                Ok(_) => {
                    info!(
                        component = "auth_store",
                        event = "auth.init.verified",
                        "Persisted session verified"
                    );
                    self.start_auto_refresh();
                    AuthStatus::Authenticated
                }
                Err(e) => {
                    warn!(
                        component = "auth_store",
                        event = "auth.init.commit_failed",
                        error = %e,
                        "Failed to persist verified session"
                    );
                    self.clear_session(None);
                    AuthStatus::Unauthenticated
                }
            },
            Err(e) if e.is_unauthorized() => self.recover_with_refresh().await,
            Err(e) => {
                warn!(
                    component = "auth_store",
                    event = "auth.init.verify_failed",
                    error = %e,
                    "Identity check failed, discarding persisted session"
                );
                self.clear_session(None);
                AuthStatus::Unauthenticated
            }
        }
    }

    async fn recover_with_refresh(self: &Arc<Self>) -> AuthStatus {
        match self.refresh().await {
            Ok(_) => AuthStatus::Authenticated,
            Err(_) => AuthStatus::Unauthenticated,
        }
    }

    /// Sign in with credentials.
    ///
    /// Any session already held stays in memory and storage until the
    /// attempt settles; a rejected attempt clears both.
    pub async fn login(self: &Arc<Self>, email: &str, password: &str) -> Result<Session, AuthError> {
        self.set_status(AuthStatus::Checking);

        let credentials = LoginRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
        };

        let payload = match self.backend.login(&credentials).await {
            Ok(payload) => payload,
            Err(e) => {
                let message = login_error_message(&e);
                warn!(
                    component = "auth_store",
                    event = "auth.login.rejected",
                    status = e.status(),
                    error = %e,
                    "Login rejected"
                );
                self.clear_session(Some(message.clone()));
                return Err(AuthError::Login(message));
            }
        };

        let Some((token, user)) = payload.into_parts() else {
            warn!(
                component = "auth_store",
                event = "auth.login.incomplete_payload",
                "Login response missing token or user"
            );
            self.clear_session(Some(INVALID_LOGIN_RESPONSE.to_string()));
            return Err(AuthError::Protocol(
                "login response did not include both token and user".into(),
            ));
        };

        match self.commit_session(&token, user, Utc::now()) {
            Ok(session) => {
                info!(
                    component = "auth_store",
                    event = "auth.login.succeeded",
                    user_id = %session.user_id,
                    role = %session.role,
                    "Logged in"
                );
                self.start_auto_refresh();
                let _ = self.events.send(SessionEvent::NavigateToDashboard);
                Ok(session)
            }
            Err(e) => {
                self.clear_session(Some(e.user_message()));
                Err(e)
            }
        }
    }

    /// Always completes locally; the server-side call is best-effort.
    pub async fn logout(&self) {
        self.stop_auto_refresh();

        if let Some(token) = self.token() {
            if let Err(e) = self.backend.logout(&token).await {
                warn!(
                    component = "auth_store",
                    event = "auth.logout.remote_failed",
                    error = %e,
                    "Server-side logout failed, clearing locally"
                );
            }
        }

        self.clear_session(None);
        info!(
            component = "auth_store",
            event = "auth.logout.completed",
            "Logged out"
        );
        let _ = self.events.send(SessionEvent::NavigateToLogin);
    }

    /// Rotate the current token.
    ///
    /// On any failure all auth state is cleared, a forced logout is announced
    /// and the error is returned.
    pub async fn refresh(self: &Arc<Self>) -> Result<Session, AuthError> {
        self.rotate(self.token()).await
    }

    /// Rotate `rejected` unless a concurrent refresh already replaced it.
    ///
    /// Used after a request came back 401 with `rejected`: if the token was
    /// rotated in the meantime the current session is returned as is.
    pub async fn refresh_if_current(self: &Arc<Self>, rejected: &str) -> Result<Session, AuthError> {
        self.rotate(Some(rejected.to_string())).await
    }

    async fn rotate(self: &Arc<Self>, seen: Option<String>) -> Result<Session, AuthError> {
        let _gate = self.refresh_gate.lock().await;

        let current = self.snapshot();
        if current.token != seen && current.is_authenticated() {
            if let Some(session) = current.session.clone() {
                debug!(
                    component = "auth_store",
                    event = "auth.refresh.coalesced",
                    "Token already rotated by a concurrent refresh"
                );
                return Ok(session);
            }
        }

        let Some(old_token) = current.token.clone() else {
            self.clear_session(None);
            return Err(AuthError::NoSession);
        };

        self.set_status(AuthStatus::Refreshing);

        let rotated = match self.backend.refresh(&old_token).await {
            Ok(payload) => payload.into_parts().ok_or_else(|| {
                AuthError::Protocol("refresh response did not include both token and user".into())
            }),
            Err(e) => Err(AuthError::Api(e)),
        };

        let (token, user) = match rotated {
            Ok(parts) => parts,
            Err(e) => return Err(self.fail_refresh(e)),
        };

        // A logout while the request was in flight wins over the rotation.
        if self.token().as_deref() != Some(old_token.as_str()) {
            debug!(
                component = "auth_store",
                event = "auth.refresh.discarded",
                "Session ended during refresh, dropping rotated token"
            );
            return Err(AuthError::NoSession);
        }

        match self.commit_session(&token, user, Utc::now()) {
            Ok(session) => {
                info!(
                    component = "auth_store",
                    event = "auth.refresh.succeeded",
                    expires_at = ?session.expires_at,
                    "Token rotated"
                );
                self.start_auto_refresh();
                Ok(session)
            }
            Err(e) => Err(self.fail_refresh(e)),
        }
    }

    fn fail_refresh(&self, error: AuthError) -> AuthError {
        warn!(
            component = "auth_store",
            event = "auth.refresh.failed",
            error = %error,
            "Token refresh failed, forcing logout"
        );
        self.clear_session(None);
        let _ = self.events.send(SessionEvent::ForcedLogout {
            reason: LogoutReason::RefreshFailed,
        });
        let _ = self.events.send(SessionEvent::NavigateToLogin);
        error
    }

    /// Re-fetch the identity and merge the server's user record.
    pub async fn refresh_user(self: &Arc<Self>) -> Result<User, AuthError> {
        let current = self.snapshot();
        let Some(token) = current.token.clone() else {
            return Err(AuthError::NoSession);
        };
        let user = self.backend.identity(&token).await?;
        let issued_at = current.persisted_at.unwrap_or_else(Utc::now);
        self.commit_session(&token, user.clone(), issued_at)?;
        Ok(user)
    }

    /// Mirror a broadcast observed from another context. Never writes storage.
    pub fn apply_broadcast(self: &Arc<Self>, record: &BroadcastRecord) {
        if record.origin.as_deref() == Some(self.id.as_str()) {
            return;
        }

        let was_authenticated = {
            let _guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
            let was_authenticated = self.snapshot.load().is_authenticated();
            match (&record.token, &record.user) {
                (Some(token), Some(user)) => {
                    self.snapshot.store(Arc::new(AuthSnapshot {
                        status: AuthStatus::Authenticated,
                        session: Some(Session::new(token, user, record.timestamp)),
                        token: Some(token.clone()),
                        user: Some(user.clone()),
                        persisted_at: Some(record.timestamp),
                        error: None,
                    }));
                    self.status_tx.send_replace(AuthStatus::Authenticated);
                }
                _ => {
                    self.snapshot.store(Arc::new(AuthSnapshot::signed_out(None)));
                    self.status_tx.send_replace(AuthStatus::Unauthenticated);
                }
            }
            was_authenticated
        };

        info!(
            component = "auth_store",
            event = "auth.broadcast.mirrored",
            origin = ?record.origin,
            signed_in = record.token.is_some(),
            "Mirrored session change from another context"
        );

        if record.token.is_some() {
            self.start_auto_refresh();
        } else {
            self.stop_auto_refresh();
            if was_authenticated {
                let _ = self.events.send(SessionEvent::NavigateToLogin);
            }
        }
    }

    /// Persist and publish a session, then swap it into memory.
    fn commit_session(
        &self,
        token: &str,
        user: User,
        issued_at: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let stored = StoredSession {
            token: token.to_string(),
            user,
            issued_at,
        };
        let session = Session::new(token, &stored.user, issued_at);

        let _guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.storage.save(&stored)?;
        if let Err(e) = self
            .storage
            .publish(&BroadcastRecord::signed_in(&stored, &self.id))
        {
            warn!(
                component = "auth_store",
                event = "auth.broadcast.publish_failed",
                error = %e,
                "Failed to publish session broadcast"
            );
        }
        self.snapshot.store(Arc::new(AuthSnapshot {
            status: AuthStatus::Authenticated,
            session: Some(session.clone()),
            token: Some(stored.token),
            user: Some(stored.user),
            persisted_at: Some(issued_at),
            error: None,
        }));
        self.status_tx.send_replace(AuthStatus::Authenticated);
        Ok(session)
    }

    /// Load a persisted snapshot into memory while it is being verified.
    fn adopt_stored(&self, stored: &StoredSession) {
        let _guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.snapshot.store(Arc::new(AuthSnapshot {
            status: AuthStatus::Checking,
            session: Some(Session::new(&stored.token, &stored.user, stored.issued_at)),
            token: Some(stored.token.clone()),
            user: Some(stored.user.clone()),
            persisted_at: Some(stored.issued_at),
            error: None,
        }));
    }

    /// Drop the session from storage and memory.
    fn clear_session(&self, error: Option<String>) {
        self.stop_auto_refresh();

        let _guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.storage.clear() {
            warn!(
                component = "auth_store",
                event = "auth.storage.clear_failed",
                error = %e,
                "Failed to clear persisted session"
            );
        }
        if let Err(e) = self.storage.publish(&BroadcastRecord::signed_out(&self.id)) {
            warn!(
                component = "auth_store",
                event = "auth.broadcast.publish_failed",
                error = %e,
                "Failed to publish session broadcast"
            );
        }
        self.snapshot.store(Arc::new(AuthSnapshot::signed_out(error)));
        self.status_tx.send_replace(AuthStatus::Unauthenticated);
    }

    fn set_status(&self, status: AuthStatus) {
        let _guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        let next = self.snapshot.load().with_status(status);
        self.snapshot.store(Arc::new(next));
        self.status_tx.send_replace(status);
    }

    /// Start the periodic refresh unless it is already running.
    fn start_auto_refresh(self: &Arc<Self>) {
        let mut guard = self.auto_refresh.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let period = self.config.auto_refresh_interval;
        *guard = Some(tokio::spawn(auto_refresh_loop(Arc::downgrade(self), period)));
    }

    fn stop_auto_refresh(&self) {
        let handle = self
            .auto_refresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn auto_refresh_running(&self) -> bool {
        self.auto_refresh
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for AuthStore {
    fn drop(&mut self) {
        self.stop_auto_refresh();
    }
}

async fn auto_refresh_loop(store: Weak<AuthStore>, period: std::time::Duration) {
    loop {
        tokio::time::sleep(period).await;
        let Some(store) = store.upgrade() else {
            return;
        };
        if store.status() != AuthStatus::Authenticated {
            return;
        }
        debug!(
            component = "auth_store",
            event = "auth.auto_refresh.tick",
            "Periodic token refresh"
        );
        // refresh() already forces the logout on failure.
        if let Err(e) = store.refresh().await {
            warn!(
                component = "auth_store",
                event = "auth.auto_refresh.failed",
                error = %e,
                "Periodic refresh failed"
            );
            return;
        }
    }
}

fn login_error_message(error: &ApiError) -> String {
    if let Some(message) = error.server_message() {
        return message.to_string();
    }
    match error.kind() {
        ErrorKind::Network | ErrorKind::Server => error.kind().default_message().to_string(),
        _ => LOGIN_FAILED.to_string(),
    }
}
