//! Collaborator contracts for the hosted backend.
//!
//! The session manager talks to the auth service and the profile table only
//! through these traits. `BackendClient` implements both over HTTP; tests use
//! in-memory fakes.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::api::ApiError;
use crate::auth::{ProfileFields, Session, UserProfile};

/// Session changes the auth service reports outside of any explicit call.
///
/// `BackendClient` only publishes `SignedOut`, when the data API rejects the
/// bearer token. `SignedIn` and `TokenRefreshed` come from services that
/// push session changes themselves, such as a realtime auth listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// A session was established or replaced out of band.
    SignedIn(Session),
    /// Tokens for the current session were rotated.
    TokenRefreshed(Session),
    /// The session for `user_id` ended server-side.
    SignedOut { user_id: String },
}

/// Result of identity creation. `session` is present when the service signs
/// the new identity in immediately (email confirmation disabled).
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub user_id: String,
    pub session: Option<Session>,
}

/// Metadata attached to the identity at creation.
#[derive(Debug, Clone, Serialize)]
pub struct SignUpMetadata {
    pub name: String,
    pub phone: String,
    pub district: String,
}

impl From<&ProfileFields> for SignUpMetadata {
    fn from(fields: &ProfileFields) -> Self {
        Self {
            name: fields.name.trim().to_string(),
            phone: fields.phone.trim().to_string(),
            district: fields.district.trim().to_string(),
        }
    }
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ApiError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<SignUpOutcome, ApiError>;

    /// Revoke the session's refresh token with the service.
    async fn sign_out(&self, session: &Session) -> Result<(), ApiError>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, ApiError>;

    /// Install (or clear) the session used to authorize subsequent requests.
    fn set_session(&self, session: Option<&Session>);

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<UserProfile>, ApiError>;

    /// Whether a profile row already uses `email` as its login identifier.
    async fn email_registered(&self, email: &str) -> Result<bool, ApiError>;

    /// Insert a profile row; the store rejects duplicate emails with `Conflict`.
    async fn insert(&self, profile: &UserProfile) -> Result<UserProfile, ApiError>;
}
