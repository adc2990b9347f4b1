use std::time::Duration;

use serde::Deserialize;

use crate::record::AccountRecord;

const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token itself was rejected; the account is unusable
    /// until re-enrolled.
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),
    #[error("token endpoint returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
}

impl RefreshError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RefreshError::InvalidGrant(_))
    }
}

/// Seam over the OAuth token endpoint so the pool can be exercised with
/// a test double.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, record: &AccountRecord) -> Result<RefreshedToken, RefreshError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct HttpTokenRefresher {
    client: wreq::Client,
}

impl HttpTokenRefresher {
    pub fn new() -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(REFRESH_TIMEOUT)
            .timeout(REFRESH_TIMEOUT)
            .build()?;
        Ok(HttpTokenRefresher { client })
    }
}

#[async_trait::async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, record: &AccountRecord) -> Result<RefreshedToken, RefreshError> {
        let form = serde_urlencoded::to_string([
            ("client_id", record.client_id.as_str()),
            ("client_secret", record.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", record.refresh_token.as_str()),
        ])
        .map_err(|err| RefreshError::Transport(err.to_string()))?;

        let response = self
            .client
            .post(&record.token_uri)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(form)
            .send()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;

        if !(200..300).contains(&status) {
            let message = String::from_utf8_lossy(&body).into_owned();
            if message.contains("invalid_grant") {
                return Err(RefreshError::InvalidGrant(message));
            }
            return Err(RefreshError::Upstream { status, message });
        }

        let payload: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| RefreshError::Transport(err.to_string()))?;
        Ok(RefreshedToken {
            access_token: payload.access_token,
            expires_in: payload.expires_in.unwrap_or(3600),
        })
    }
}
