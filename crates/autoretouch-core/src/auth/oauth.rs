use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ApiConfig, DEFAULT_USER_AGENT};

use super::{AuthError, Credentials, DeviceCodeChallenge};

pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Performs raw OAuth exchanges against the configured auth domain.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    config: ApiConfig,
}

impl OAuthClient {
    pub fn new(config: ApiConfig) -> Result<Self, AuthError> {
        Self::with_user_agent(config, DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(config: ApiConfig, user_agent: &str) -> Result<Self, AuthError> {
        let http = Client::builder().user_agent(user_agent).build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Start a device authorization grant.
    pub async fn request_device_code(&self) -> Result<DeviceCodeChallenge, AuthError> {
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("scope", self.config.scope.as_str()),
            ("audience", self.config.audience.as_str()),
        ];

        let response = self
            .http
            .post(self.config.auth_url("oauth/device/code")?)
            .form(&form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint { status, body });
        }

        let payload: DeviceCodeResponse = response.json().await?;
        Ok(payload.into_challenge())
    }

    /// Single poll of the token endpoint for a pending device code.
    pub async fn exchange_device_code(&self, device_code: &str) -> Result<Credentials, AuthError> {
        let form = [
            ("grant_type", DEVICE_CODE_GRANT),
            ("device_code", device_code),
            ("client_id", self.config.client_id.as_str()),
        ];
        let response = self
            .http
            .post(self.config.auth_url("oauth/token")?)
            .form(&form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        self.handle_token_response(response, None).await
    }

    /// Exchange a refresh token; the token is carried forward when the
    /// response omits a new one.
    pub async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Credentials, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        let response = self
            .http
            .post(self.config.auth_url("oauth/token")?)
            .form(&form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        self.handle_token_response(response, Some(refresh_token))
            .await
    }

    /// Revoke a refresh token, returning the status code of the revoke endpoint.
    pub async fn revoke(&self, refresh_token: &str) -> Result<StatusCode, AuthError> {
        #[derive(Serialize)]
        struct RevokeRequest<'a> {
            client_id: &'a str,
            token: &'a str,
        }

        let response = self
            .http
            .post(self.config.auth_url("oauth/revoke")?)
            .json(&RevokeRequest {
                client_id: &self.config.client_id,
                token: refresh_token,
            })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint { status, body });
        }
        debug!(%status, "refresh token revoked");
        Ok(status)
    }

    async fn handle_token_response(
        &self,
        response: reqwest::Response,
        previous_refresh_token: Option<&str>,
    ) -> Result<Credentials, AuthError> {
        let status = response.status();
        let received_at = Utc::now();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "".into());
            return Err(AuthError::TokenEndpoint { status, body });
        }

        let body = response.text().await?;
        let payload: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| AuthError::InvalidGrantResponse(err.to_string()))?;
        payload.into_credentials(received_at, previous_refresh_token)
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: Option<String>,
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

impl DeviceCodeResponse {
    fn into_challenge(self) -> DeviceCodeChallenge {
        DeviceCodeChallenge {
            device_code: self.device_code,
            user_code: self.user_code,
            verification_uri: self
                .verification_uri_complete
                .or(self.verification_uri)
                .unwrap_or_default(),
            expires_in: self.expires_in,
            interval: self.interval,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: i64,
    #[serde(default)]
    scope: String,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl TokenResponse {
    fn into_credentials(
        self,
        received_at: DateTime<Utc>,
        previous_refresh_token: Option<&str>,
    ) -> Result<Credentials, AuthError> {
        let refresh_token = match previous_refresh_token {
            Some(previous) => previous.to_owned(),
            None => self.refresh_token.ok_or_else(|| {
                AuthError::InvalidGrantResponse("no refresh token in token response".into())
            })?,
        };

        let expires_at = u32::try_from(self.expires_in)
            .ok()
            .and_then(|secs| Duration::try_seconds(i64::from(secs)))
            .and_then(|lifetime| received_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::InvalidGrantResponse(format!(
                    "expires_in out of range: {}",
                    self.expires_in
                ))
            })?;

        Ok(Credentials {
            access_token: self.access_token,
            refresh_token,
            scope: self.scope,
            token_type: self.token_type,
            expires_at,
        })
    }
}

/// Error body returned by the token endpoint (`{"error": "...", ...}`).
#[derive(Debug, Deserialize)]
pub(crate) struct OAuthErrorBody {
    pub error: String,
}

impl OAuthErrorBody {
    pub(crate) fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }
}
