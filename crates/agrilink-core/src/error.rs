//! Classified outcomes returned by session operations.

use thiserror::Error;

use crate::api::ApiError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Email already registered")]
    IdentifierAlreadyRegistered,

    #[error("Password too weak: {0}")]
    WeakSecret(String),

    #[error("No profile found for user {user_id}")]
    ProfileNotFound { user_id: String },

    /// The profile store answered with a record for a different identity.
    #[error("Profile record belongs to {profile_user_id}, not signed-in user {user_id}")]
    ProfileMismatch {
        user_id: String,
        profile_user_id: String,
    },

    /// The service no longer accepts the session's tokens.
    #[error("Session expired or revoked, sign in again")]
    SessionExpired,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SessionError {
    /// Terminal outcomes caused by what the user entered, as opposed to
    /// transport or service failures.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            SessionError::Validation(_)
                | SessionError::InvalidCredentials
                | SessionError::IdentifierAlreadyRegistered
                | SessionError::WeakSecret(_)
        )
    }
}

impl From<ApiError> for SessionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::InvalidCredentials => SessionError::InvalidCredentials,
            ApiError::UserAlreadyExists | ApiError::Conflict(_) => {
                SessionError::IdentifierAlreadyRegistered
            }
            ApiError::WeakPassword(reason) => SessionError::WeakSecret(reason),
            ApiError::Unauthorized => SessionError::SessionExpired,
            other => SessionError::Network(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_classification() {
        assert_eq!(
            SessionError::from(ApiError::InvalidCredentials),
            SessionError::InvalidCredentials
        );
        assert_eq!(
            SessionError::from(ApiError::UserAlreadyExists),
            SessionError::IdentifierAlreadyRegistered
        );
        assert_eq!(
            SessionError::from(ApiError::Conflict("duplicate key".into())),
            SessionError::IdentifierAlreadyRegistered
        );
        assert_eq!(
            SessionError::from(ApiError::WeakPassword("too short".into())),
            SessionError::WeakSecret("too short".into())
        );
        assert!(matches!(
            SessionError::from(ApiError::ServerError("boom".into())),
            SessionError::Network(_)
        ));
        assert_eq!(
            SessionError::from(ApiError::Unauthorized),
            SessionError::SessionExpired
        );
    }

    #[test]
    fn test_is_domain() {
        assert!(SessionError::InvalidCredentials.is_domain());
        assert!(SessionError::Validation("x".into()).is_domain());
        assert!(!SessionError::Network("x".into()).is_domain());
        assert!(!SessionError::ProfileNotFound { user_id: "u1".into() }.is_domain());
        assert!(!SessionError::SessionExpired.is_domain());
    }
}
