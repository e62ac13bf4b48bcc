//! agrilink-core: session lifecycle for the agrilink farmer app.
//!
//! This crate provides the pieces a presentation layer needs to gate on
//! "is a farmer signed in":
//! - `SessionManager`: sign-in, sign-up, sign-out, session restore, token
//!   refresh, and state change subscriptions
//! - `BackendClient`: HTTP client for the hosted auth service and profile table
//! - `SessionStore` implementations for persisting the session between runs
//! - `Config`: endpoint and storage configuration

pub mod api;
pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod manager;

pub use api::{ApiError, BackendClient};
pub use auth::{
    FileSessionStore, KeyringSessionStore, MemorySessionStore, ProfileFields, Session,
    SessionStore, UserProfile,
};
pub use backend::{AuthEvent, AuthService, ProfileStore};
pub use config::{Config, SessionStorageKind};
pub use error::SessionError;
pub use manager::{AuthState, ListenerHandle, ManagerSettings, SessionManager, Subscription};
