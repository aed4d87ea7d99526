use shared::error::ApiException;
use thiserror::Error;

/// Failure taxonomy for the sync engine. Nothing here is fatal; each variant is
/// contained to the operation that produced it.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("credential rejected: {0}")]
    AuthRejected(String),
    #[error("network failure: {0}")]
    Transient(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("no credential available")]
    MissingCredential,
    #[error("room or session changed before the request resolved")]
    Stale,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

impl From<ApiException> for SyncError {
    fn from(value: ApiException) -> Self {
        if value.is_auth_rejected() {
            Self::AuthRejected(value.message)
        } else {
            Self::Transient(value.to_string())
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::MalformedPayload(value.to_string())
        } else {
            Self::Transient(value.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::MalformedPayload(value.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(value: url::ParseError) -> Self {
        Self::Config(value.to_string())
    }
}
