use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::credential::TokenGrant;
use super::AuthError;

/// The identity provider's refresh operation.
#[async_trait]
pub trait TokenProvider: Debug + Send + Sync {
    /// Exchanges a refresh token for a new access token.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::NotAuthorized` if the refresh token was rejected,
    /// `AuthError::RefreshFailed` for anything transient.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

/// OAuth 2.0 refresh-token grant against `{login_url}/services/oauth2/token`.
#[derive(Debug, Clone)]
pub struct OAuthTokenProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    instance_url: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokenProvider {
    /// Creates a provider for `login_url`, e.g. `https://login.salesforce.com`.
    #[must_use]
    pub fn new(
        login_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            token_url: format!("{}/services/oauth2/token", login_url.trim_end_matches('/')),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    #[must_use]
    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (code, description) = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| (e.error, e.error_description.unwrap_or_default()))
                .unwrap_or_else(|_| (status.to_string(), body));

            // invalid_grant: the refresh token was revoked or expired.
            if code == "invalid_grant" || code == "invalid_client" {
                return Err(AuthError::NotAuthorized {
                    message: format!("{code}: {description}"),
                });
            }
            return Err(AuthError::RefreshFailed {
                message: format!("{} {code}: {description}", status.as_u16()),
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| AuthError::RefreshFailed {
            message: format!("unreadable token response: {e}"),
        })?;

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            instance_url: token.instance_url,
            token_type: token.token_type,
            expires_in: token.expires_in.map(Duration::from_secs),
        })
    }
}
