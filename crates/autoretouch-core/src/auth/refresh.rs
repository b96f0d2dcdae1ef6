use tracing::debug;

use super::{AuthError, Credentials, OAuthClient};

/// Exchanges refresh tokens for fresh access tokens.
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    oauth: OAuthClient,
}

impl TokenRefresher {
    pub fn new(oauth: OAuthClient) -> Self {
        Self { oauth }
    }

    /// The returned credentials always keep `refresh_token`, whatever the
    /// endpoint sends back.
    pub async fn exchange(&self, refresh_token: &str) -> Result<Credentials, AuthError> {
        let mut credentials = self.oauth.exchange_refresh_token(refresh_token).await?;
        credentials.refresh_token = refresh_token.to_owned();
        debug!(expires_at = %credentials.expires_at, "access token refreshed");
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use httpmock::prelude::*;

    fn refresher(server: &MockServer) -> TokenRefresher {
        let config = ApiConfig::new(
            &server.base_url(),
            &server.base_url(),
            "client",
            "offline_access",
            "https://api.example.com",
        )
        .unwrap();
        TokenRefresher::new(OAuthClient::new(config).unwrap())
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_not_adopted() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth/token")
                .body_contains("grant_type=refresh_token")
                .body_contains("client_id=client");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "fresh",
                "refresh_token": "rotated",
                "token_type": "Bearer",
                "expires_in": 3600,
                "scope": "offline_access"
            }));
        });

        let credentials = refresher(&server).exchange("original").await.unwrap();
        mock.assert();
        assert_eq!(credentials.access_token, "fresh");
        assert_eq!(credentials.refresh_token, "original");
    }

    #[tokio::test]
    async fn rejected_refresh_is_token_endpoint_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(403)
                .json_body_obj(&serde_json::json!({ "error": "invalid_grant" }));
        });

        let err = refresher(&server).exchange("revoked").await.unwrap_err();
        assert!(err.requires_login());
    }
}
