use std::fmt;

use crate::auth::{Session, UserProfile};

/// Where the application stands with respect to sign-in.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    /// Startup, before the persisted session has been looked at.
    Initializing,
    Anonymous,
    /// An explicit sign-in or sign-up is in flight.
    Authenticating,
    /// Signed in, with the profile whose `user_id` matches the session.
    Authenticated {
        session: Session,
        profile: UserProfile,
    },
    /// Signed in, but no profile record exists for the identity.
    ProfileMissing { session: Session },
    /// No valid session after an unrecoverable error.
    Failed { reason: String },
}

impl AuthState {
    /// Pair a session with its profile. `None` if the identities disagree.
    pub fn authenticated(session: Session, profile: UserProfile) -> Option<Self> {
        if session.user_id == profile.user_id {
            Some(AuthState::Authenticated { session, profile })
        } else {
            None
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthState::Authenticated { session, .. } | AuthState::ProfileMissing { session } => {
                Some(session)
            }
            _ => None,
        }
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        match self {
            AuthState::Authenticated { profile, .. } => Some(profile),
            _ => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session().map(|s| s.user_id.as_str())
    }

    /// Gate for screens that need a signed-in farmer with a profile
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthState::Initializing => "initializing",
            AuthState::Anonymous => "anonymous",
            AuthState::Authenticating => "authenticating",
            AuthState::Authenticated { .. } => "authenticated",
            AuthState::ProfileMissing { .. } => "profile_missing",
            AuthState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthState::Authenticated { profile, .. } => {
                write!(f, "signed in as {} <{}>", profile.name, profile.email)
            }
            AuthState::ProfileMissing { session } => {
                write!(f, "signed in as {} (no profile record)", session.email)
            }
            AuthState::Failed { reason } => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}
