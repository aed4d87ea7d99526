use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
    Unknown,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 422 => Self::Validation,
            429 => Self::RateLimited,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{code:?} ({status}): {message}")]
pub struct ApiException {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
}

impl ApiException {
    pub fn from_response(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = if body.trim().is_empty() {
            format!("Request failed with status {status}")
        } else {
            body
        };
        Self {
            status,
            code: ErrorCode::from_status(status),
            message,
        }
    }

    /// Only an explicit 401 means the credential was rejected. A 403 is a
    /// per-resource denial and leaves the session intact.
    pub fn is_auth_rejected(&self) -> bool {
        self.code == ErrorCode::Unauthorized
    }
}
