//! REST client module for the hosted backend.
//!
//! This module provides the `BackendClient` for the backend's auth service
//! (password sign-in, sign-up, token refresh, sign-out) and the `user`
//! profile table.
//!
//! Data requests carry the signed-in user's access token as a bearer so row
//! level security sees the right identity.

pub mod client;
pub mod error;

pub use client::BackendClient;
pub use error::ApiError;
