use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// OAuth credentials issued by the autoRetouch auth domain.
///
/// `expires_at` is fixed when the grant is received (`expires_in` plus the
/// capture time) and never recomputed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub scope: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn will_expire_within(&self, window: Duration) -> bool {
        Utc::now() + window >= self.expires_at
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}
