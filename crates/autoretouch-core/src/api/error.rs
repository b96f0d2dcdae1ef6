use reqwest::StatusCode;
use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;

/// Errors returned by the REST client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API responded with status {status}, reason: {reason}")]
    HttpStatus {
        status: StatusCode,
        reason: String,
        body: String,
    },
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("organization id missing; set a default organization or pass one explicitly")]
    MissingOrganization,
    #[error("result path must start with /image/, got '{0}'")]
    InvalidResultPath(String),
    #[error("response is not a workflow execution id: '{0}'")]
    InvalidExecutionId(String),
    #[error("file name missing in path '{0}'")]
    MissingFileName(String),
}

pub type ApiResult<T> = Result<T, ApiError>;
