//! Twitch implementations of the platform traits in [`crate::api`].
//!
//! - [`TwitchAuth`]: OAuth token endpoint (`TokenExchange`)
//! - [`HelixClient`]: REST API (`LivenessQuery`, `IdentityLookup`, `SubscriptionApi`)
//!
//! Base URLs are configurable so tests can point the clients at a mock server.

use std::time::Duration;

mod auth;
mod helix;

pub use auth::TwitchAuth;
pub use helix::HelixClient;

/// Default OAuth base URL.
pub const DEFAULT_AUTH_BASE: &str = "https://id.twitch.tv/oauth2";

/// Default Helix REST base URL.
pub const DEFAULT_API_BASE: &str = "https://api.twitch.tv/helix";

/// Scopes requested in the user authorization URL.
pub const USER_SCOPES: &[&str] = &["user:read:email"];

/// Per-request timeout for every HTTP call.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the shared HTTP client with the request timeout applied.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("livewatch/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Application credentials registered with the platform.
#[derive(Clone)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}
