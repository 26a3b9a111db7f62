//! Helix REST client.

use std::sync::Arc;

use async_trait::async_trait;
use lw_core::{ChannelId, Handle, LiveStream};
use lw_protocol::{EventKind, StreamsResponse, SubscriptionRequest, SubscriptionsResponse, UsersResponse};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::DEFAULT_API_BASE;
use crate::api::{ApiError, Identity, IdentityLookup, LivenessQuery, SubscriptionApi};
use crate::credentials::CredentialManager;

/// Maximum ids accepted by one `/streams` query.
pub const MAX_IDS_PER_QUERY: usize = 100;

/// Helix API client.
///
/// Liveness and identity calls use the service credential; subscription
/// management uses the user credential.
pub struct HelixClient {
    http: reqwest::Client,
    client_id: String,
    credentials: Arc<CredentialManager>,
    base_url: String,
}

impl HelixClient {
    pub fn new(
        http: reqwest::Client,
        client_id: impl Into<String>,
        credentials: Arc<CredentialManager>,
    ) -> Self {
        Self::with_base_url(http, client_id, credentials, DEFAULT_API_BASE)
    }

    /// Create a client against a specific base URL (useful for testing).
    pub fn with_base_url(
        http: reqwest::Client,
        client_id: impl Into<String>,
        credentials: Arc<CredentialManager>,
        base_url: &str,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            credentials,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .header("Client-Id", &self.client_id)
            .bearer_auth(token)
    }

    async fn service_request(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let token = self.credentials.service_token().await?;
        Ok(self.authorized(request, &token).send().await?)
    }

    async fn user_request(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let token = self.credentials.user_token().await?;
        Ok(self.authorized(request, &token).send().await?)
    }
}

/// Fails with `ApiError::Status` unless the response status is `expected`
/// (or any success when `expected` is `None`).
async fn check_status(response: Response, expected: Option<StatusCode>) -> Result<Response, ApiError> {
    let status = response.status();
    let ok = match expected {
        Some(code) => status == code,
        None => status.is_success(),
    };

    if ok {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl LivenessQuery for HelixClient {
    async fn query_liveness(&self, channel_ids: &[ChannelId]) -> Result<Vec<LiveStream>, ApiError> {
        if channel_ids.is_empty() {
            return Ok(Vec::new());
        }

        if channel_ids.len() > MAX_IDS_PER_QUERY {
            warn!(
                requested = channel_ids.len(),
                max = MAX_IDS_PER_QUERY,
                "Liveness query exceeds per-request limit"
            );
        }

        let mut query: Vec<(&str, &str)> = channel_ids
            .iter()
            .map(|id| ("user_id", id.as_str()))
            .collect();
        query.push(("first", "100"));

        let request = self.http.get(self.url("streams")).query(&query);
        let response = check_status(self.service_request(request).await?, None).await?;
        let streams: StreamsResponse = decode(response).await?;

        debug!(
            queried = channel_ids.len(),
            live = streams.data.len(),
            "Liveness query complete"
        );
        Ok(streams.data.into_iter().map(LiveStream::from).collect())
    }
}

#[async_trait]
impl IdentityLookup for HelixClient {
    async fn resolve_identity(&self, handle: &Handle) -> Result<Identity, ApiError> {
        let request = self
            .http
            .get(self.url("users"))
            .query(&[("login", handle.as_str())]);
        let response = check_status(self.service_request(request).await?, None).await?;
        let users: UsersResponse = decode(response).await?;

        let user = users
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFound(handle.clone()))?;

        // The platform's login is authoritative; fall back to the requested handle
        let resolved = Handle::parse(&user.login).unwrap_or_else(|_| handle.clone());

        Ok(Identity {
            channel_id: ChannelId::new(user.id),
            handle: resolved,
            display_name: user.display_name,
        })
    }
}

#[async_trait]
impl SubscriptionApi for HelixClient {
    async fn create_subscription(
        &self,
        kind: EventKind,
        channel_id: &ChannelId,
        session_id: &str,
    ) -> Result<String, ApiError> {
        let body = SubscriptionRequest::new(kind, channel_id, session_id);
        let request = self.http.post(self.url("eventsub/subscriptions")).json(&body);
        let response = check_status(
            self.user_request(request).await?,
            Some(StatusCode::ACCEPTED),
        )
        .await?;

        let created: SubscriptionsResponse = decode(response).await?;
        let subscription = created
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Decode("subscription response has no data".to_string()))?;

        debug!(
            channel_id = %channel_id,
            kind = %kind,
            subscription_id = %subscription.id,
            "Subscription created"
        );
        Ok(subscription.id)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ApiError> {
        let request = self
            .http
            .delete(self.url("eventsub/subscriptions"))
            .query(&[("id", subscription_id)]);
        let response = self.user_request(request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(subscription_id, "Subscription already gone");
            return Ok(());
        }

        check_status(response, None).await?;
        debug!(subscription_id, "Subscription deleted");
        Ok(())
    }
}
