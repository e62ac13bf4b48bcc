use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid login credentials")]
    InvalidCredentials,

    #[error("User already registered")]
    UserAlreadyExists,

    #[error("Weak password: {0}")]
    WeakPassword(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired or revoked")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Postgres unique_violation, surfaced by the data API on duplicate inserts
const UNIQUE_VIOLATION_CODE: &str = "23505";

/// Error payload shapes used by the auth and data APIs.
/// Auth errors carry `error`/`error_code`/`msg`; data API errors carry
/// `code`/`message`.
#[derive(Debug, Default, Deserialize)]
struct ServiceErrorBody {
    error: Option<String>,
    error_code: Option<String>,
    error_description: Option<String>,
    code: Option<serde_json::Value>,
    msg: Option<String>,
    message: Option<String>,
}

impl ServiceErrorBody {
    fn code(&self) -> Option<String> {
        if let Some(ref code) = self.error_code {
            return Some(code.clone());
        }
        match self.code {
            Some(serde_json::Value::String(ref s)) => Some(s.clone()),
            _ => self.error.clone(),
        }
    }

    fn message(&self) -> Option<&str> {
        self.msg
            .as_deref()
            .or(self.message.as_deref())
            .or(self.error_description.as_deref())
    }
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: ServiceErrorBody = serde_json::from_str(body).unwrap_or_default();
        let code = parsed.code().unwrap_or_default();
        let message = parsed.message().unwrap_or_default().to_lowercase();

        match code.as_str() {
            "invalid_grant" | "invalid_credentials" => return ApiError::InvalidCredentials,
            "user_already_exists" | "email_exists" => return ApiError::UserAlreadyExists,
            "weak_password" => {
                let reason = parsed.message().unwrap_or("password does not meet policy");
                return ApiError::WeakPassword(reason.to_string());
            }
            UNIQUE_VIOLATION_CODE => return ApiError::Conflict(Self::truncate_body(body)),
            _ => {}
        }
        if message.contains("already registered") {
            return ApiError::UserAlreadyExists;
        }

        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 if message.contains("invalid login credentials") => ApiError::InvalidCredentials,
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            409 => ApiError::Conflict(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_invalid_grant_is_invalid_credentials() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_REQUEST, body),
            ApiError::InvalidCredentials
        ));

        let body = r#"{"code":400,"error_code":"invalid_credentials","msg":"Invalid login credentials"}"#;
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_REQUEST, body),
            ApiError::InvalidCredentials
        ));
    }

    #[test]
    fn test_signup_errors() {
        let body = r#"{"code":422,"error_code":"user_already_exists","msg":"User already registered"}"#;
        assert!(matches!(
            ApiError::from_status(StatusCode::UNPROCESSABLE_ENTITY, body),
            ApiError::UserAlreadyExists
        ));

        let body = r#"{"code":422,"error_code":"weak_password","msg":"Password should be at least 6 characters."}"#;
        match ApiError::from_status(StatusCode::UNPROCESSABLE_ENTITY, body) {
            ApiError::WeakPassword(reason) => assert!(reason.contains("6 characters")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unique_violation_is_conflict() {
        let body = r#"{"code":"23505","details":null,"hint":null,"message":"duplicate key value violates unique constraint \"user_email_key\""}"#;
        assert!(matches!(
            ApiError::from_status(StatusCode::CONFLICT, body),
            ApiError::Conflict(_)
        ));
    }

    #[test]
    fn test_status_fallbacks() {
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, "{}"),
            ApiError::Unauthorized
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            ApiError::ServerError(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::IM_A_TEAPOT, "not json"),
            ApiError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 10);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("truncated"));
        assert!(truncated.len() < long.len() + 40);
    }
}
