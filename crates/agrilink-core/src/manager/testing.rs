//! In-memory backend fakes for session manager tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::{broadcast, Notify};

use crate::api::ApiError;
use crate::auth::{Session, SessionStore, UserProfile};
use crate::backend::{AuthEvent, AuthService, ProfileStore, SignUpMetadata, SignUpOutcome};

/// Pauses a fake call until the test releases it.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Account {
    password: String,
    user_id: String,
}

pub struct FakeAuth {
    accounts: Mutex<HashMap<String, Account>>,
    next_id: AtomicUsize,
    token_serial: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
    pub installed: Mutex<Option<Session>>,
    pub sign_in_gate: Mutex<Option<Arc<Gate>>>,
    pub fail_sign_out: AtomicBool,
    pub revoke_refresh: AtomicBool,
    pub sign_up_signs_in: AtomicBool,
    pub session_ttl_minutes: AtomicUsize,
    events: broadcast::Sender<AuthEvent>,
}

impl FakeAuth {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            accounts: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            token_serial: AtomicUsize::new(1),
            calls: Mutex::new(Vec::new()),
            installed: Mutex::new(None),
            sign_in_gate: Mutex::new(None),
            fail_sign_out: AtomicBool::new(false),
            revoke_refresh: AtomicBool::new(false),
            sign_up_signs_in: AtomicBool::new(false),
            session_ttl_minutes: AtomicUsize::new(60),
            events,
        })
    }

    pub fn add_account(&self, email: &str, password: &str, user_id: &str) {
        lock(&self.accounts).insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user_id: user_id.to_string(),
            },
        );
    }

    pub fn hold_sign_in(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *lock(&self.sign_in_gate) = Some(gate.clone());
        gate
    }

    pub fn push(&self, event: AuthEvent) {
        self.events.send(event).expect("no event subscribers");
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn issue(&self, user_id: &str, email: &str) -> Session {
        let serial = self.token_serial.fetch_add(1, Ordering::SeqCst);
        let ttl = self.session_ttl_minutes.load(Ordering::SeqCst) as i64;
        Session {
            access_token: format!("access-{}-{}", user_id, serial),
            refresh_token: format!("refresh-{}-{}", user_id, serial),
            expires_at: Utc::now() + Duration::minutes(ttl),
            user_id: user_id.to_string(),
            email: email.to_string(),
        }
    }

    fn record(&self, call: &str) {
        lock(&self.calls).push(call.to_string());
    }
}

#[async_trait]
impl AuthService for FakeAuth {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        self.record("sign_in");
        let gate = lock(&self.sign_in_gate).take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let user_id = match lock(&self.accounts).get(email) {
            Some(account) if account.password == password => account.user_id.clone(),
            _ => return Err(ApiError::InvalidCredentials),
        };
        Ok(self.issue(&user_id, email))
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        _metadata: &SignUpMetadata,
    ) -> Result<SignUpOutcome, ApiError> {
        self.record("sign_up");
        if lock(&self.accounts).contains_key(email) {
            return Err(ApiError::UserAlreadyExists);
        }
        let user_id = format!("new-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.add_account(email, password, &user_id);
        let session = if self.sign_up_signs_in.load(Ordering::SeqCst) {
            Some(self.issue(&user_id, email))
        } else {
            None
        };
        Ok(SignUpOutcome { user_id, session })
    }

    async fn sign_out(&self, _session: &Session) -> Result<(), ApiError> {
        self.record("sign_out");
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError("logout unavailable".to_string()));
        }
        Ok(())
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, ApiError> {
        self.record("refresh");
        if self.revoke_refresh.load(Ordering::SeqCst) {
            return Err(ApiError::InvalidCredentials);
        }
        let current = lock(&self.installed).clone();
        match current {
            Some(session) if session.refresh_token == refresh_token => {
                Ok(self.issue(&session.user_id, &session.email))
            }
            _ => Err(ApiError::InvalidCredentials),
        }
    }

    fn set_session(&self, session: Option<&Session>) {
        *lock(&self.installed) = session.cloned();
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct FakeProfiles {
    rows: Mutex<HashMap<String, UserProfile>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_insert: AtomicBool,
    pub offline: AtomicBool,
    /// Reject the bearer token on reads, as for a session revoked server-side
    pub revoked: AtomicBool,
}

impl FakeProfiles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, profile: UserProfile) {
        lock(&self.rows).insert(profile.user_id.clone(), profile);
    }

    /// Store `profile` under another identity's key.
    pub fn add_under(&self, user_id: &str, profile: UserProfile) {
        lock(&self.rows).insert(user_id.to_string(), profile);
    }

    pub fn get(&self, user_id: &str) -> Option<UserProfile> {
        lock(&self.rows).get(user_id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: &str) -> Result<(), ApiError> {
        lock(&self.calls).push(call.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError("profile store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for FakeProfiles {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<UserProfile>, ApiError> {
        self.record("find_by_user_id")?;
        if self.revoked.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized);
        }
        Ok(self.get(user_id))
    }

    async fn email_registered(&self, email: &str) -> Result<bool, ApiError> {
        self.record("email_registered")?;
        Ok(lock(&self.rows).values().any(|p| p.email == email))
    }

    async fn insert(&self, profile: &UserProfile) -> Result<UserProfile, ApiError> {
        self.record("insert")?;
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError("insert rejected".to_string()));
        }
        if lock(&self.rows).values().any(|p| p.email == profile.email) {
            return Err(ApiError::Conflict("duplicate email".to_string()));
        }
        self.add(profile.clone());
        Ok(profile.clone())
    }
}

/// Store whose reads always fail.
pub struct BrokenStore;

#[async_trait]
impl SessionStore for BrokenStore {
    async fn load(&self) -> Result<Option<Session>> {
        Err(anyhow!("disk on fire"))
    }

    async fn save(&self, _session: &Session) -> Result<()> {
        Err(anyhow!("disk on fire"))
    }

    async fn clear(&self) -> Result<()> {
        Err(anyhow!("disk on fire"))
    }
}
