mod credential_store;
mod credentials;
mod device_flow;
mod error;
mod manager;
mod oauth;
mod refresh;

pub use credential_store::{CredentialStore, FileCredentialStore};
pub use credentials::Credentials;
pub use device_flow::{ChallengePresenter, DeviceCodeChallenge, DeviceFlowAuthenticator};
pub use error::AuthError;
pub use manager::CredentialManager;
pub use oauth::{OAuthClient, DEVICE_CODE_GRANT};
pub use refresh::TokenRefresher;
