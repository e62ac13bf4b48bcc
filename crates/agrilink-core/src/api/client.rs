//! HTTP client for the hosted backend.
//!
//! This module provides `BackendClient`, which speaks the backend's auth
//! (`/auth/v1`) and data (`/rest/v1`) REST contracts and implements the
//! `AuthService` and `ProfileStore` traits the session manager consumes.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{header, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{Session, UserProfile};
use crate::backend::{AuthEvent, AuthService, ProfileStore, SignUpMetadata, SignUpOutcome};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow mobile links while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Table holding farmer profiles
const PROFILE_TABLE: &str = "user";

/// Capacity of the out-of-band auth event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    /// Seconds since epoch
    expires_at: Option<i64>,
    /// Lifetime in seconds, used when `expires_at` is absent
    expires_in: Option<i64>,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

/// Sign-up returns a token response when the identity is signed in
/// immediately, or just the user object when confirmation is pending.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(AuthUser),
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct SignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: &'a SignUpMetadata,
}

#[derive(Debug, Deserialize)]
struct EmailRow {
    #[allow(dead_code)]
    email: String,
}

impl TokenResponse {
    fn into_session(self, fallback_email: &str) -> Result<Session, ApiError> {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Utc
                .timestamp_opt(at, 0)
                .single()
                .ok_or_else(|| ApiError::InvalidResponse(format!("Invalid expires_at {}", at)))?,
            (None, Some(secs)) => Utc::now() + chrono::Duration::seconds(secs),
            (None, None) => {
                return Err(ApiError::InvalidResponse(
                    "Token response has no expiry".to_string(),
                ))
            }
        };
        Ok(Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user_id: self.user.id,
            email: self.user.email.unwrap_or_else(|| fallback_email.to_string()),
        })
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client for the hosted backend.
///
/// Holds the current session so data API calls run as the signed-in user,
/// falling back to the anon key when nobody is signed in.
pub struct BackendClient {
    client: Client,
    base_url: String,
    anon_key: String,
    session: RwLock<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
}

impl BackendClient {
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            session: RwLock::new(None),
            events,
        })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn rest_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, PROFILE_TABLE)
    }

    /// Profile table read filtered on `column = value`. Values go through
    /// `RequestBuilder::query` so `+`, `&` and `#` in emails stay literal.
    fn profile_query(
        &self,
        column: &'static str,
        value: &str,
        select: &'static str,
        session: Option<&Session>,
    ) -> RequestBuilder {
        let filter = format!("eq.{}", value);
        self.authorize(self.client.get(self.rest_url()), session)
            .query(&[(column, filter.as_str()), ("select", select)])
    }

    fn current_session(&self) -> Option<Session> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Attach the API key and the bearer: the user's access token when
    /// signed in, the anon key otherwise.
    fn authorize(&self, request: RequestBuilder, session: Option<&Session>) -> RequestBuilder {
        let bearer = session
            .map(|s| s.access_token.as_str())
            .unwrap_or(self.anon_key.as_str());
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
            .header(header::ACCEPT, "application/json")
    }

    /// Check if response is successful, returning a classified error if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, retrying with exponential backoff while rate limited.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().send().await?;
            if response.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Self::check_response(response).await;
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2;
        }
    }

    /// Profile table read as the current user. A 401 here means the session
    /// was revoked or expired server-side; subscribers hear about it.
    async fn rest_get<T: DeserializeOwned>(
        &self,
        column: &'static str,
        value: &str,
        select: &'static str,
    ) -> Result<T, ApiError> {
        let session = self.current_session();
        let result = self
            .send(|| self.profile_query(column, value, select, session.as_ref()))
            .await;

        match result {
            Ok(response) => response.json().await.map_err(|e| {
                ApiError::InvalidResponse(format!("Failed to parse {} lookup: {}", column, e))
            }),
            Err(ApiError::Unauthorized) => {
                self.report_revoked(session.as_ref());
                Err(ApiError::Unauthorized)
            }
            Err(e) => Err(e),
        }
    }

    fn report_revoked(&self, session: Option<&Session>) {
        if let Some(session) = session {
            warn!(user_id = %session.user_id, "Backend rejected session token");
            // No subscribers is fine
            let _ = self.events.send(AuthEvent::SignedOut {
                user_id: session.user_id.clone(),
            });
        }
    }

    async fn token_request<B: Serialize>(
        &self,
        grant_type: &str,
        body: &B,
        fallback_email: &str,
    ) -> Result<Session, ApiError> {
        let url = format!("{}?grant_type={}", self.auth_url("token"), grant_type);
        let response = self
            .send(|| self.authorize(self.client.post(&url), None).json(body))
            .await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse token response: {}", e)))?;
        token.into_session(fallback_email)
    }
}

#[async_trait]
impl AuthService for BackendClient {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        debug!(email = email, "Password sign-in");
        let session = self
            .token_request("password", &PasswordGrant { email, password }, email)
            .await?;
        self.set_session(Some(&session));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<SignUpOutcome, ApiError> {
        debug!(email = email, "Creating identity");
        let url = self.auth_url("signup");
        let request = SignUpRequest {
            email,
            password,
            data: metadata,
        };
        let response = self
            .send(|| self.authorize(self.client.post(&url), None).json(&request))
            .await?;
        let parsed: SignUpResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse sign-up response: {}", e)))?;

        match parsed {
            SignUpResponse::Session(token) => {
                let session = token.into_session(email)?;
                Ok(SignUpOutcome {
                    user_id: session.user_id.clone(),
                    session: Some(session),
                })
            }
            SignUpResponse::User(user) => Ok(SignUpOutcome {
                user_id: user.id,
                session: None,
            }),
        }
    }

    async fn sign_out(&self, session: &Session) -> Result<(), ApiError> {
        let url = self.auth_url("logout");
        let result = self
            .send(|| self.authorize(self.client.post(&url), Some(session)))
            .await;
        self.set_session(None);

        match result {
            Ok(_) => Ok(()),
            // Already revoked server-side
            Err(ApiError::Unauthorized) | Err(ApiError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, ApiError> {
        let fallback_email = self.current_session().map(|s| s.email).unwrap_or_default();
        let session = self
            .token_request("refresh_token", &RefreshGrant { refresh_token }, &fallback_email)
            .await?;
        self.set_session(Some(&session));
        Ok(session)
    }

    fn set_session(&self, session: Option<&Session>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = session.cloned();
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ProfileStore for BackendClient {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<UserProfile>, ApiError> {
        let mut rows: Vec<UserProfile> = self.rest_get("userid", user_id, "*").await?;
        if rows.len() > 1 {
            return Err(ApiError::InvalidResponse(format!(
                "{} profile rows for user {}",
                rows.len(),
                user_id
            )));
        }
        Ok(rows.pop())
    }

    async fn email_registered(&self, email: &str) -> Result<bool, ApiError> {
        let rows: Vec<EmailRow> = self.rest_get("email", email, "email").await?;
        Ok(!rows.is_empty())
    }

    async fn insert(&self, profile: &UserProfile) -> Result<UserProfile, ApiError> {
        let url = self.rest_url();
        let session = self.current_session();
        let response = self
            .send(|| {
                self.authorize(self.client.post(&url), session.as_ref())
                    .header("Prefer", "return=representation")
                    .json(&[profile])
            })
            .await?;
        let mut rows: Vec<UserProfile> = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse inserted profile: {}", e)))?;
        rows.pop()
            .ok_or_else(|| ApiError::InvalidResponse("Insert returned no rows".to_string()))
    }
}
