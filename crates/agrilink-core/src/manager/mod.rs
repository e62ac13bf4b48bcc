//! Session lifecycle for the farmer app.
//!
//! `SessionManager` owns every transition between anonymous and signed-in
//! state: sign-in, sign-up, sign-out, restoring the persisted session at
//! startup, token refresh, and session changes pushed by the auth service.
//! It keeps the in-memory profile consistent with the current session.
//!
//! All state-changing work runs under one FIFO async lock, so explicit
//! operations, pushed events and refreshes apply one at a time in arrival
//! order. Reads never wait on that lock.

mod state;
mod subscription;

#[cfg(test)]
mod testing;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::ApiError;
use crate::auth::{is_valid_email, ProfileFields, Session, SessionStore, UserProfile};
use crate::backend::{AuthEvent, AuthService, ProfileStore, SignUpMetadata};
use crate::config::Config;
use crate::error::SessionError;

pub use state::AuthState;
pub use subscription::{ListenerHandle, Subscription};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub min_secret_length: usize,
    /// `None` disables the background refresh task
    pub auto_refresh_interval: Option<Duration>,
    pub event_buffer_size: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            min_secret_length: config.min_secret_length,
            auto_refresh_interval: Some(config.auto_refresh_interval()),
            event_buffer_size: config.event_buffer_size.max(1),
        }
    }
}

struct Inner {
    state: AuthState,
    last_error: Option<String>,
}

/// Counts an issued operation until it settles, however it exits.
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SessionManager {
    auth: Arc<dyn AuthService>,
    profiles: Arc<dyn ProfileStore>,
    store: Arc<dyn SessionStore>,
    settings: ManagerSettings,
    op_lock: tokio::sync::Mutex<()>,
    inner: RwLock<Inner>,
    pending: AtomicUsize,
    changes: broadcast::Sender<AuthState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        auth: Arc<dyn AuthService>,
        profiles: Arc<dyn ProfileStore>,
        store: Arc<dyn SessionStore>,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        let (changes, _) = broadcast::channel(settings.event_buffer_size.max(1));
        Arc::new(Self {
            auth,
            profiles,
            store,
            settings,
            op_lock: tokio::sync::Mutex::new(()),
            inner: RwLock::new(Inner {
                state: AuthState::Initializing,
                last_error: None,
            }),
            pending: AtomicUsize::new(0),
            changes,
            tasks: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the manager: restore the persisted session, then follow the auth
    /// service's session events and keep the token fresh in the background.
    pub async fn init(self: &Arc<Self>) -> Result<Option<Session>, SessionError> {
        // Subscribe before restoring so nothing pushed meanwhile is lost
        let events = self.auth.subscribe();
        let restored = self.restore_session().await;

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.is_empty() {
            tasks.push(Self::spawn_event_pump(Arc::downgrade(self), events));
            if let Some(interval) = self.settings.auto_refresh_interval {
                tasks.push(Self::spawn_auto_refresh(Arc::downgrade(self), interval));
            }
        }
        restored
    }

    /// Stop background tasks. State stays readable.
    pub fn dispose(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        debug!("Session manager disposed");
    }

    fn spawn_event_pump(
        manager: Weak<Self>,
        mut events: broadcast::Receiver<AuthEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.apply_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Missed auth events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Auth event pump stopped");
        })
    }

    fn spawn_auto_refresh(manager: Weak<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                if let Err(e) = manager.refresh_if_needed().await {
                    warn!(error = %e, "Background token refresh failed");
                }
            }
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn state(&self) -> AuthState {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).state.clone()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .session()
            .cloned()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .profile()
            .cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .is_authenticated()
    }

    /// True while any issued operation has not settled
    pub fn is_loading(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    /// Message of the most recent failed operation
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_error
            .clone()
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Ordered feed of transitions. Each subscriber buffers up to
    /// `event_buffer_size` transitions; one that falls further behind skips
    /// the oldest and can see how many via [`Subscription::missed`].
    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.changes.subscribe())
    }

    /// Run `callback` on every transition, in its own task. Must be called
    /// from within a Tokio runtime.
    pub fn on_change<F>(&self, mut callback: F) -> ListenerHandle
    where
        F: FnMut(&AuthState) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        ListenerHandle::new(tokio::spawn(async move {
            while let Some(state) = subscription.next().await {
                callback(&state);
            }
        }))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(Session, UserProfile), SessionError> {
        let _pending = PendingGuard::new(&self.pending);
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return self.reject(SessionError::Validation(
                "Email and password required".to_string(),
            ));
        }

        let _op = self.op_lock.lock().await;
        let previous = self.begin_authenticating();
        let result = self.sign_in_locked(email, password).await;
        self.settle(previous, result).await
    }

    async fn sign_in_locked(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(Session, UserProfile), SessionError> {
        let session = self.auth.sign_in_with_password(email, password).await?;
        info!(user_id = %session.user_id, "Sign-in accepted");
        self.install(&session).await;

        match self.resolve_profile(&session).await? {
            Some(profile) => {
                self.enter_authenticated(session.clone(), profile.clone())?;
                Ok((session, profile))
            }
            None => {
                warn!(user_id = %session.user_id, "Sign-in succeeded but no profile record found");
                let user_id = session.user_id.clone();
                self.transition(AuthState::ProfileMissing { session });
                Err(SessionError::ProfileNotFound { user_id })
            }
        }
    }

    /// Register a farmer: check the email is free, create the identity,
    /// insert the profile, then sign in.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        fields: &ProfileFields,
    ) -> Result<(Session, UserProfile), SessionError> {
        let _pending = PendingGuard::new(&self.pending);
        let email = email.trim();
        if !is_valid_email(email) {
            return self.reject(SessionError::Validation(format!(
                "'{}' is not a valid email",
                email
            )));
        }
        if password.chars().count() < self.settings.min_secret_length {
            return self.reject(SessionError::WeakSecret(format!(
                "must be at least {} characters",
                self.settings.min_secret_length
            )));
        }
        if let Err(e) = fields.validate() {
            return self.reject(e);
        }

        let _op = self.op_lock.lock().await;
        let previous = self.begin_authenticating();
        let result = self.sign_up_locked(email, password, fields).await;
        self.settle(previous, result).await
    }

    async fn sign_up_locked(
        &self,
        email: &str,
        password: &str,
        fields: &ProfileFields,
    ) -> Result<(Session, UserProfile), SessionError> {
        if self.profiles.email_registered(email).await? {
            return Err(SessionError::IdentifierAlreadyRegistered);
        }

        let outcome = self
            .auth
            .sign_up(email, password, &SignUpMetadata::from(fields))
            .await?;
        info!(user_id = %outcome.user_id, "Identity created");

        // Insert as the new user when the service signed them in already
        if let Some(ref session) = outcome.session {
            self.auth.set_session(Some(session));
        }

        let record = UserProfile::new_farmer(&outcome.user_id, email, fields);
        let profile = match self.profiles.insert(&record).await {
            Ok(profile) => profile,
            Err(e) => {
                // No compensating delete: the identity stays without a profile
                error!(
                    user_id = %outcome.user_id,
                    email = email,
                    error = %e,
                    "Profile insert failed after identity creation; identity left without profile"
                );
                return Err(e.into());
            }
        };

        let session = match outcome.session {
            Some(session) => session,
            None => self.auth.sign_in_with_password(email, password).await?,
        };
        self.install(&session).await;
        self.enter_authenticated(session.clone(), profile.clone())?;
        info!(user_id = %session.user_id, "Sign-up complete");
        Ok((session, profile))
    }

    /// Sign out. Local state is cleared even when revocation fails; the
    /// revocation error is still returned.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let _pending = PendingGuard::new(&self.pending);
        let _op = self.op_lock.lock().await;
        self.set_last_error(None);

        let remote = match self.state().session() {
            Some(session) => self.auth.sign_out(session).await.map_err(SessionError::from),
            None => Ok(()),
        };

        self.auth.set_session(None);
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Failed to clear persisted session");
        }
        self.transition(AuthState::Anonymous);

        if let Err(ref e) = remote {
            warn!(error = %e, "Remote sign-out failed; signed out locally");
            self.set_last_error(Some(e.to_string()));
        }
        remote
    }

    /// Pick up the session persisted by a previous run. An unreadable store
    /// is treated as no session.
    pub async fn restore_session(&self) -> Result<Option<Session>, SessionError> {
        let _pending = PendingGuard::new(&self.pending);
        let _op = self.op_lock.lock().await;

        let loaded = match self.store.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session, starting signed out");
                None
            }
        };

        let Some(session) = loaded else {
            debug!("No persisted session");
            self.auth.set_session(None);
            self.transition(AuthState::Anonymous);
            return Ok(None);
        };

        if session.is_expired() {
            info!(user_id = %session.user_id, "Persisted session expired");
            self.auth.set_session(None);
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "Failed to clear expired session");
            }
            self.transition(AuthState::Anonymous);
            return Ok(None);
        }

        self.auth.set_session(Some(&session));
        match self.resolve_profile(&session).await {
            Ok(Some(profile)) => {
                if let Err(e) = self.enter_authenticated(session.clone(), profile) {
                    return Err(self.fail(e));
                }
                info!(user_id = %session.user_id, "Session restored");
                Ok(Some(session))
            }
            Ok(None) => {
                warn!(user_id = %session.user_id, "Restored session has no profile record");
                self.transition(AuthState::ProfileMissing {
                    session: session.clone(),
                });
                Ok(Some(session))
            }
            Err(SessionError::SessionExpired) => {
                warn!(user_id = %session.user_id, "Persisted session rejected by backend");
                self.end_session().await;
                Ok(None)
            }
            // The persisted session is kept so the next start can retry
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Rotate the current session's tokens now. `Ok(None)` when there is no
    /// session or the service revoked it.
    pub async fn refresh_session(&self) -> Result<Option<Session>, SessionError> {
        let _pending = PendingGuard::new(&self.pending);
        let _op = self.op_lock.lock().await;
        self.refresh_locked(true).await
    }

    async fn refresh_if_needed(&self) -> Result<Option<Session>, SessionError> {
        let _op = self.op_lock.lock().await;
        self.refresh_locked(false).await
    }

    async fn refresh_locked(&self, force: bool) -> Result<Option<Session>, SessionError> {
        let Some(current) = self.state().session().cloned() else {
            return Ok(None);
        };
        if !force && !current.needs_refresh() {
            return Ok(Some(current));
        }

        debug!(user_id = %current.user_id, "Refreshing session");
        match self.auth.refresh_session(&current.refresh_token).await {
            Ok(session) => {
                self.adopt_session(session).await;
                Ok(self.current_session())
            }
            Err(ApiError::InvalidCredentials) | Err(ApiError::Unauthorized) => {
                warn!(user_id = %current.user_id, "Refresh token rejected, ending session");
                self.end_session().await;
                Ok(None)
            }
            Err(e) => {
                let err = SessionError::from(e);
                self.set_last_error(Some(err.to_string()));
                Err(err)
            }
        }
    }

    // =========================================================================
    // Pushed session changes
    // =========================================================================

    async fn apply_event(&self, event: AuthEvent) {
        let _op = self.op_lock.lock().await;
        match event {
            AuthEvent::SignedIn(session) => {
                info!(user_id = %session.user_id, "Session established externally");
                self.adopt_session(session).await;
            }
            AuthEvent::TokenRefreshed(session) => {
                if self.state().session().is_none() {
                    debug!(user_id = %session.user_id, "Ignoring token refresh with no active session");
                    return;
                }
                self.adopt_session(session).await;
            }
            AuthEvent::SignedOut { user_id } => {
                if self.state().user_id() != Some(user_id.as_str()) {
                    debug!(user_id = %user_id, "Ignoring sign-out for another identity");
                    return;
                }
                info!(user_id = %user_id, "Session ended by auth service");
                self.end_session().await;
            }
        }
    }

    /// Install a session handed over by the auth service. The cached profile
    /// is kept only when the identity is unchanged.
    async fn adopt_session(&self, session: Session) {
        self.install(&session).await;

        if let AuthState::Authenticated { profile, .. } = self.state() {
            if profile.user_id == session.user_id {
                self.transition(AuthState::Authenticated { session, profile });
                return;
            }
        }

        match self.resolve_profile(&session).await {
            Ok(Some(profile)) => {
                if let Err(e) = self.enter_authenticated(session, profile) {
                    self.fail(e);
                }
            }
            Ok(None) => self.transition(AuthState::ProfileMissing { session }),
            Err(SessionError::SessionExpired) => {
                warn!(user_id = %session.user_id, "New session rejected by backend");
                self.end_session().await;
            }
            Err(e) => {
                warn!(user_id = %session.user_id, error = %e, "Profile fetch failed for new session");
                self.auth.set_session(None);
                if let Err(e) = self.store.clear().await {
                    warn!(error = %e, "Failed to clear persisted session");
                }
                self.fail(e);
            }
        }
    }

    async fn end_session(&self) {
        self.auth.set_session(None);
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Failed to clear persisted session");
        }
        self.transition(AuthState::Anonymous);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn transition(&self, next: AuthState) {
        let previous = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut inner.state, next.clone())
        };
        info!(from = previous.name(), to = next.name(), "Auth state changed");
        // No subscribers is fine
        let _ = self.changes.send(next);
    }

    fn set_last_error(&self, message: Option<String>) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).last_error = message;
    }

    /// Report a failure caught before any state change.
    fn reject<T>(&self, err: SessionError) -> Result<T, SessionError> {
        debug!(error = %err, "Rejected before contacting backend");
        self.set_last_error(Some(err.to_string()));
        Err(err)
    }

    fn begin_authenticating(&self) -> AuthState {
        self.set_last_error(None);
        let previous = self.state();
        self.transition(AuthState::Authenticating);
        previous
    }

    /// Enter `Failed` and record the reason.
    fn fail(&self, err: SessionError) -> SessionError {
        error!(error = %err, "Session manager failed");
        self.set_last_error(Some(err.to_string()));
        self.transition(AuthState::Failed {
            reason: err.to_string(),
        });
        err
    }

    fn enter_authenticated(&self, session: Session, profile: UserProfile) -> Result<(), SessionError> {
        if session.user_id != profile.user_id {
            error!(
                user_id = %session.user_id,
                profile_user_id = %profile.user_id,
                "Profile store returned another identity's record"
            );
            return Err(SessionError::ProfileMismatch {
                user_id: session.user_id,
                profile_user_id: profile.user_id,
            });
        }
        self.transition(AuthState::Authenticated { session, profile });
        Ok(())
    }

    /// Leave `Authenticating` after an explicit operation. Failures that did
    /// not already pick a state go back to the prior session if there was
    /// one; otherwise domain failures land in `Anonymous`, others in `Failed`.
    async fn settle<T>(
        &self,
        previous: AuthState,
        result: Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        self.set_last_error(Some(err.to_string()));
        debug!(error = %err, "Operation failed");

        if self.state() != AuthState::Authenticating {
            return Err(err);
        }

        let next = match previous {
            prior if prior.session().is_some() => prior,
            _ if err.is_domain() => AuthState::Anonymous,
            _ => AuthState::Failed {
                reason: err.to_string(),
            },
        };

        self.auth.set_session(next.session());
        let synced = match next.session() {
            Some(session) => self.store.save(session).await,
            None => self.store.clear().await,
        };
        if let Err(e) = synced {
            warn!(error = %e, "Failed to sync persisted session after failure");
        }
        self.transition(next);
        Err(err)
    }

    async fn resolve_profile(&self, session: &Session) -> Result<Option<UserProfile>, SessionError> {
        debug!(user_id = %session.user_id, "Fetching profile");
        Ok(self.profiles.find_by_user_id(&session.user_id).await?)
    }

    /// Make `session` the one the backend authorizes with, and persist it.
    async fn install(&self, session: &Session) {
        self.auth.set_session(Some(session));
        if let Err(e) = self.store.save(session).await {
            warn!(error = %e, "Failed to persist session");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
