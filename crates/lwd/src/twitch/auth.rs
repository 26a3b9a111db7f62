use async_trait::async_trait;
use lw_core::Credential;
use lw_protocol::TokenResponse;
use tracing::debug;
use url::Url;

use super::{AppCredentials, DEFAULT_AUTH_BASE, USER_SCOPES};
use crate::api::TokenExchange;
use crate::credentials::CredentialError;

/// OAuth token endpoint client.
pub struct TwitchAuth {
    http: reqwest::Client,
    app: AppCredentials,
    base_url: String,
}

impl TwitchAuth {
    pub fn new(http: reqwest::Client, app: AppCredentials) -> Self {
        Self::with_base_url(http, app, DEFAULT_AUTH_BASE)
    }

    /// Create a client against a specific base URL (useful for testing).
    pub fn with_base_url(http: reqwest::Client, app: AppCredentials, base_url: &str) -> Self {
        Self {
            http,
            app,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<Credential, CredentialError> {
        let url = format!("{}/token", self.base_url);

        let response = self
            .http
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| CredentialError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Exchange(format!("{status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Exchange(format!("invalid token response: {e}")))?;

        debug!(expires_in = token.expires_in, "Token endpoint issued credential");
        Ok(Credential::expiring_in(token.access_token, token.expires_in))
    }
}

#[async_trait]
impl TokenExchange for TwitchAuth {
    async fn client_credentials(&self) -> Result<Credential, CredentialError> {
        self.request_token(&[
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ])
        .await
    }

    async fn authorization_code(&self, code: &str) -> Result<Credential, CredentialError> {
        self.request_token(&[
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.app.redirect_uri.as_str()),
        ])
        .await
    }

    fn authorization_url(&self) -> String {
        let base = format!("{}/authorize", self.base_url);
        let scope = USER_SCOPES.join(" ");
        let params = [
            ("client_id", self.app.client_id.as_str()),
            ("redirect_uri", self.app.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
        ];

        match Url::parse_with_params(&base, params) {
            Ok(url) => url.to_string(),
            // Malformed base URL
            Err(_) => format!(
                "{base}?client_id={}&response_type=code",
                self.app.client_id
            ),
        }
    }
}
