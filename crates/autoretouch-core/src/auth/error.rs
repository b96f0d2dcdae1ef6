use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by authentication and credential management routines.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to persist credentials: {0}")]
    Persistence(#[source] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("token endpoint returned an unusable grant: {0}")]
    InvalidGrantResponse(String),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("no stored credentials or refresh token available; log in first")]
    NoCredentialsAvailable,
    #[error("device code not confirmed after {waited_secs} seconds")]
    DeviceFlowTimeout { waited_secs: u64 },
    #[error("authorization request denied ({0})")]
    AccessDenied(String),
    #[error("authorization flow cancelled")]
    Cancelled,
}

impl AuthError {
    /// Whether the auth server rejected the grant and the user must log in again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::TokenEndpoint { .. }
                | AuthError::NoCredentialsAvailable
                | AuthError::AccessDenied(_)
        )
    }
}
