//! REST and OAuth response bodies.
//!
//! All list endpoints wrap their results in a `data` array. Unknown fields
//! are ignored so platform additions do not break decoding.

use lw_core::{ChannelId, LiveStream};
use serde::Deserialize;

/// OAuth token endpoint response (client-credentials and authorization-code grants).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// `GET /users` response.
#[derive(Debug, Clone, Deserialize)]
pub struct UsersResponse {
    #[serde(default)]
    pub data: Vec<HelixUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

/// `GET /streams` response. Only live channels are listed.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamsResponse {
    #[serde(default)]
    pub data: Vec<HelixStream>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixStream {
    pub user_id: String,
    #[serde(default)]
    pub user_login: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub viewer_count: u64,
    #[serde(default)]
    pub started_at: Option<String>,
}

impl From<HelixStream> for LiveStream {
    fn from(stream: HelixStream) -> Self {
        Self {
            channel_id: ChannelId::new(stream.user_id),
            title: stream.title,
            category: stream.game_name,
            viewer_count: stream.viewer_count,
            started_at: stream.started_at,
        }
    }
}

/// `POST /eventsub/subscriptions` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionsResponse {
    #[serde(default)]
    pub data: Vec<CreatedSubscription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedSubscription {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}
