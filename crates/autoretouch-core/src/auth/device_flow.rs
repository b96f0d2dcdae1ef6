//! OAuth2 device authorization grant.
//!
//! The flow requests a device code, shows the user code and verification URL,
//! then polls the token endpoint every `interval` seconds until the user
//! confirms or `expires_in` seconds have been accounted for. Elapsed time is
//! counted as `interval` per attempt rather than measured.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::oauth::OAuthErrorBody;
use super::{AuthError, Credentials, OAuthClient};

/// Device code issued by the auth domain, valid until `expires_in` elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodeChallenge {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

/// Callback used to show the user code and verification URL.
pub type ChallengePresenter = Arc<dyn Fn(&DeviceCodeChallenge) + Send + Sync>;

/// Drives the device authorization grant end-to-end.
#[derive(Clone)]
pub struct DeviceFlowAuthenticator {
    oauth: OAuthClient,
    open_browser: bool,
    presenter: ChallengePresenter,
    cancel: Option<CancellationToken>,
    tick: StdDuration,
}

impl DeviceFlowAuthenticator {
    pub fn new(oauth: OAuthClient) -> Self {
        Self {
            oauth,
            open_browser: true,
            presenter: Arc::new(print_challenge),
            cancel: None,
            tick: StdDuration::from_secs(1),
        }
    }

    pub fn with_browser(mut self, open_browser: bool) -> Self {
        self.open_browser = open_browser;
        self
    }

    pub fn with_presenter<F>(mut self, presenter: F) -> Self
    where
        F: Fn(&DeviceCodeChallenge) + Send + Sync + 'static,
    {
        self.presenter = Arc::new(presenter);
        self
    }

    /// Abort the wait between polls once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Wall-clock length of one `interval` second. Only the sleep is scaled;
    /// the `expires_in` accounting stays in protocol seconds.
    pub fn with_tick(mut self, tick: StdDuration) -> Self {
        self.tick = tick;
        self
    }

    /// Run the whole grant and return the issued credentials.
    pub async fn authenticate(&self) -> Result<Credentials, AuthError> {
        let challenge = self.oauth.request_device_code().await?;
        info!(
            user_code = %challenge.user_code,
            verification_uri = %challenge.verification_uri,
            expires_in = challenge.expires_in,
            "device code issued"
        );

        (self.presenter)(&challenge);

        if self.open_browser {
            if let Err(err) = open::that(&challenge.verification_uri) {
                warn!(error = %err, "failed to open browser; continue at the printed URL");
            }
        }

        self.wait_for_confirmation(&challenge).await
    }

    /// Poll the token endpoint until the challenge is confirmed or expires.
    pub async fn wait_for_confirmation(
        &self,
        challenge: &DeviceCodeChallenge,
    ) -> Result<Credentials, AuthError> {
        let interval = challenge.interval.max(1);
        let mut waited_secs = 0;

        while waited_secs < challenge.expires_in {
            match self.oauth.exchange_device_code(&challenge.device_code).await {
                Ok(credentials) => {
                    info!(waited_secs, "device code confirmed");
                    return Ok(credentials);
                }
                Err(AuthError::TokenEndpoint { body, .. }) if is_access_denied(&body) => {
                    return Err(AuthError::AccessDenied(body));
                }
                Err(err @ AuthError::InvalidGrantResponse(_)) => return Err(err),
                Err(err) => {
                    debug!(error = %err, waited_secs, "waiting for user confirmation");
                }
            }

            waited_secs += interval;
            if waited_secs >= challenge.expires_in {
                break;
            }
            self.pause(interval).await?;
        }

        Err(AuthError::DeviceFlowTimeout { waited_secs })
    }

    async fn pause(&self, interval: u64) -> Result<(), AuthError> {
        let delay = self
            .tick
            .saturating_mul(u32::try_from(interval).unwrap_or(u32::MAX));
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(()),
                    _ = token.cancelled() => Err(AuthError::Cancelled),
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

fn is_access_denied(body: &str) -> bool {
    OAuthErrorBody::parse(body).is_some_and(|err| err.error == "access_denied")
}

fn print_challenge(challenge: &DeviceCodeChallenge) {
    eprintln!(
        "\nOpen {} in your browser and confirm the code '{}'.\n",
        challenge.verification_uri, challenge.user_code
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use httpmock::prelude::*;
    use std::sync::Mutex;

    fn authenticator(server: &MockServer) -> DeviceFlowAuthenticator {
        let config = ApiConfig::new(
            &server.base_url(),
            &server.base_url(),
            "client",
            "offline_access",
            "https://api.example.com",
        )
        .unwrap();
        DeviceFlowAuthenticator::new(OAuthClient::new(config).unwrap())
            .with_browser(false)
            .with_presenter(|_| {})
            .with_tick(StdDuration::from_millis(1))
    }

    fn challenge(expires_in: u64, interval: u64) -> DeviceCodeChallenge {
        DeviceCodeChallenge {
            device_code: "dev-code".into(),
            user_code: "ABCD-EFGH".into(),
            verification_uri: "https://auth.example.com/activate".into(),
            expires_in,
            interval,
        }
    }

    fn pending_mock(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(403).json_body_obj(&serde_json::json!({
                "error": "authorization_pending",
                "error_description": "User has yet to authorize device code."
            }));
        })
    }

    #[tokio::test]
    async fn times_out_after_expires_in() {
        let server = MockServer::start();
        let mock = pending_mock(&server);

        let err = authenticator(&server)
            .wait_for_confirmation(&challenge(5, 2))
            .await
            .unwrap_err();

        mock.assert_hits(3);
        match err {
            AuthError::DeviceFlowTimeout { waited_secs } => assert_eq!(waited_secs, 6),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            AuthError::DeviceFlowTimeout { waited_secs: 6 }.to_string(),
            "device code not confirmed after 6 seconds"
        );
    }

    #[tokio::test]
    async fn polls_stop_at_expires_in_boundary() {
        let server = MockServer::start();
        let mock = pending_mock(&server);

        let err = authenticator(&server)
            .wait_for_confirmation(&challenge(4, 2))
            .await
            .unwrap_err();

        mock.assert_hits(2);
        assert!(matches!(err, AuthError::DeviceFlowTimeout { waited_secs: 4 }));
    }

    #[tokio::test]
    async fn grant_on_last_allowed_poll_is_accepted() {
        let server = MockServer::start();
        let mut pending = pending_mock(&server);
        let authenticator = authenticator(&server).with_tick(StdDuration::from_millis(50));

        let wait = tokio::spawn(async move {
            authenticator
                .wait_for_confirmation(&challenge(4, 2))
                .await
        });

        while pending.hits_async().await < 1 {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        pending.delete_async().await;
        let granted = server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth/token");
                then.status(200).json_body_obj(&serde_json::json!({
                    "access_token": "late",
                    "refresh_token": "refresh",
                    "expires_in": 3600
                }));
            })
            .await;

        let credentials = wait.await.unwrap().unwrap();
        granted.assert_hits_async(1).await;
        assert_eq!(credentials.access_token, "late");
    }

    #[tokio::test]
    async fn unusable_grant_ends_flow() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "granted",
                "expires_in": 3600
            }));
        });

        let err = authenticator(&server)
            .wait_for_confirmation(&challenge(5, 2))
            .await
            .unwrap_err();

        mock.assert_hits(1);
        assert!(matches!(err, AuthError::InvalidGrantResponse(_)));
    }

    #[tokio::test]
    async fn zero_interval_still_advances() {
        let server = MockServer::start();
        let mock = pending_mock(&server);

        let err = authenticator(&server)
            .wait_for_confirmation(&challenge(3, 0))
            .await
            .unwrap_err();

        mock.assert_hits(3);
        assert!(matches!(err, AuthError::DeviceFlowTimeout { waited_secs: 3 }));
    }

    #[tokio::test]
    async fn confirmed_grant_stops_polling() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth/token")
                .body_contains("device_code=dev-code");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "access",
                "refresh_token": "refresh",
                "token_type": "Bearer",
                "expires_in": 86400,
                "scope": "offline_access"
            }));
        });

        let credentials = authenticator(&server)
            .wait_for_confirmation(&challenge(5, 2))
            .await
            .unwrap();

        mock.assert_hits(1);
        assert_eq!(credentials.access_token, "access");
        assert_eq!(credentials.refresh_token, "refresh");
    }

    #[tokio::test]
    async fn access_denied_ends_flow() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(403).json_body_obj(&serde_json::json!({
                "error": "access_denied",
                "error_description": "User cancelled the confirmation prompt."
            }));
        });

        let err = authenticator(&server)
            .wait_for_confirmation(&challenge(30, 1))
            .await
            .unwrap_err();

        mock.assert_hits(1);
        assert!(matches!(err, AuthError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let server = MockServer::start();
        let mock = pending_mock(&server);
        let token = CancellationToken::new();
        token.cancel();

        let err = authenticator(&server)
            .with_tick(StdDuration::from_secs(60))
            .with_cancellation(token)
            .wait_for_confirmation(&challenge(600, 5))
            .await
            .unwrap_err();

        mock.assert_hits(1);
        assert!(matches!(err, AuthError::Cancelled));
    }

    #[tokio::test]
    async fn authenticate_presents_challenge() {
        let server = MockServer::start();
        let device_mock = server.mock(|when, then| {
            when.method(POST).path("/oauth/device/code");
            then.status(200).json_body_obj(&serde_json::json!({
                "device_code": "dev-code",
                "user_code": "WXYZ-1234",
                "verification_uri_complete": "https://auth.example.com/activate?user_code=WXYZ-1234",
                "expires_in": 10,
                "interval": 1
            }));
        });
        let token_mock = server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "access",
                "refresh_token": "refresh",
                "token_type": "Bearer",
                "expires_in": 60
            }));
        });

        let shown = Arc::new(Mutex::new(None));
        let recorder = shown.clone();
        let credentials = authenticator(&server)
            .with_presenter(move |challenge| {
                *recorder.lock().unwrap() = Some(challenge.user_code.clone());
            })
            .authenticate()
            .await
            .unwrap();

        device_mock.assert();
        token_mock.assert();
        assert_eq!(credentials.access_token, "access");
        assert_eq!(shown.lock().unwrap().as_deref(), Some("WXYZ-1234"));
    }
}
