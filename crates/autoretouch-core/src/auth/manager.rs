use chrono::Duration;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    AuthError, CredentialStore, Credentials, DeviceFlowAuthenticator, OAuthClient, TokenRefresher,
};

const DEFAULT_REFRESH_WINDOW_SECS: i64 = 30;

/// Owns the live credentials and hands out bearer tokens that stay valid for
/// at least the refresh window.
///
/// `ensure_valid` runs under a per-instance lock, so concurrent callers never
/// trigger more than one acquisition or refresh at a time.
pub struct CredentialManager {
    oauth: OAuthClient,
    authenticator: DeviceFlowAuthenticator,
    refresher: TokenRefresher,
    store: Option<Box<dyn CredentialStore + Send + Sync>>,
    refresh_token: Option<String>,
    persist: bool,
    device_flow: bool,
    refresh_window: Duration,
    current: Mutex<Option<Credentials>>,
}

impl CredentialManager {
    pub fn new(oauth: OAuthClient) -> Self {
        Self {
            authenticator: DeviceFlowAuthenticator::new(oauth.clone()),
            refresher: TokenRefresher::new(oauth.clone()),
            oauth,
            store: None,
            refresh_token: None,
            persist: true,
            device_flow: true,
            refresh_window: Duration::seconds(DEFAULT_REFRESH_WINDOW_SECS),
            current: Mutex::new(None),
        }
    }

    pub fn with_store<S>(mut self, store: S) -> Self
    where
        S: CredentialStore + Send + Sync + 'static,
    {
        self.store = Some(Box::new(store));
        self
    }

    /// Refresh token that takes precedence over any stored credentials.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Whether newly obtained credentials are written to the store.
    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// When disabled, a missing refresh token and credentials file is an
    /// error instead of a prompt.
    pub fn with_device_flow(mut self, enabled: bool) -> Self {
        self.device_flow = enabled;
        self
    }

    pub fn with_authenticator(mut self, authenticator: DeviceFlowAuthenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    /// Credentials currently held in memory, without any I/O.
    pub async fn current(&self) -> Option<Credentials> {
        self.current.lock().await.clone()
    }

    /// Return credentials valid for at least the refresh window, acquiring or
    /// refreshing them first when needed.
    pub async fn ensure_valid(&self) -> Result<Credentials, AuthError> {
        let mut current = self.current.lock().await;

        let (credentials, fetched) = match current.as_ref() {
            Some(existing) => self.refresh_if_stale(existing).await?,
            None => self.acquire().await?,
        };

        if fetched {
            self.persist(&credentials);
        }
        *current = Some(credentials.clone());
        Ok(credentials)
    }

    /// Revoke the refresh token. Local state, including the stored file, is left alone.
    pub async fn revoke(&self) -> Result<StatusCode, AuthError> {
        let current = self.current.lock().await;
        let refresh_token = match current.as_ref() {
            Some(credentials) => credentials.refresh_token.clone(),
            None => match &self.refresh_token {
                Some(token) => token.clone(),
                None => {
                    self.load_stored()?
                        .ok_or(AuthError::NoCredentialsAvailable)?
                        .refresh_token
                }
            },
        };
        let status = self.oauth.revoke(&refresh_token).await?;
        info!(%status, "refresh token revoked");
        Ok(status)
    }

    /// Drop in-memory credentials and delete the stored record.
    pub async fn forget(&self) -> Result<(), AuthError> {
        let mut current = self.current.lock().await;
        if let Some(store) = &self.store {
            store.delete()?;
        }
        *current = None;
        Ok(())
    }

    async fn acquire(&self) -> Result<(Credentials, bool), AuthError> {
        if let Some(refresh_token) = &self.refresh_token {
            debug!("exchanging supplied refresh token");
            let credentials = self.refresher.exchange(refresh_token).await?;
            return Ok((credentials, true));
        }

        if let Some(stored) = self.load_stored()? {
            debug!("loaded stored credentials");
            return self.refresh_if_stale(&stored).await;
        }

        if !self.device_flow {
            return Err(AuthError::NoCredentialsAvailable);
        }

        info!("no credentials available; starting device authorization");
        let credentials = self.authenticator.authenticate().await?;
        Ok((credentials, true))
    }

    async fn refresh_if_stale(
        &self,
        credentials: &Credentials,
    ) -> Result<(Credentials, bool), AuthError> {
        if !credentials.will_expire_within(self.refresh_window) {
            return Ok((credentials.clone(), false));
        }
        info!(expires_at = %credentials.expires_at, "access token expired, refreshing");
        let refreshed = self.refresher.exchange(&credentials.refresh_token).await?;
        Ok((refreshed, true))
    }

    fn load_stored(&self) -> Result<Option<Credentials>, AuthError> {
        match &self.store {
            Some(store) => store.load(),
            None => Ok(None),
        }
    }

    fn persist(&self, credentials: &Credentials) {
        if !self.persist {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(credentials) {
            warn!(error = %err, "credentials could not be persisted; using them in memory only");
        }
    }
}
