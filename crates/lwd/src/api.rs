//! Seams between the daemon and the streaming platform.
//!
//! Every outbound call the pipelines make goes through one of these traits,
//! so tests can substitute in-memory fakes for the HTTP clients in
//! [`crate::twitch`].

use async_trait::async_trait;
use lw_core::{ChannelId, Credential, Handle, LiveStream};
use lw_protocol::EventKind;
use thiserror::Error;

use crate::credentials::CredentialError;

// ============================================================================
// Errors
// ============================================================================

/// Errors from platform API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The platform answered with an unexpected status code.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Identity lookup found no channel with this handle.
    #[error("no channel named '{0}'")]
    NotFound(Handle),

    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// No usable credential for the call.
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl ApiError {
    /// Returns the authorization URL if this failure needs operator action.
    pub fn authorization_url(&self) -> Option<&str> {
        match self {
            Self::Credential(e) => e.authorization_url(),
            _ => None,
        }
    }
}

// ============================================================================
// Identity
// ============================================================================

/// A channel as resolved from its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub channel_id: ChannelId,
    pub handle: Handle,
    pub display_name: String,
}

// ============================================================================
// Traits
// ============================================================================

/// Batch liveness query: returns only the channels that are currently live.
///
/// Callers pass at most 100 ids per call.
#[async_trait]
pub trait LivenessQuery: Send + Sync {
    async fn query_liveness(&self, channel_ids: &[ChannelId]) -> Result<Vec<LiveStream>, ApiError>;
}

/// Resolves a handle to the platform's stable channel id.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// # Errors
    ///
    /// `ApiError::NotFound` if no channel has this handle.
    async fn resolve_identity(&self, handle: &Handle) -> Result<Identity, ApiError>;
}

/// Push subscription management. Requires a user credential.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    /// Creates a subscription bound to `session_id` and returns its id.
    async fn create_subscription(
        &self,
        kind: EventKind,
        channel_id: &ChannelId,
        session_id: &str,
    ) -> Result<String, ApiError>;

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ApiError>;
}

/// OAuth token endpoint operations.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Obtains a service (app) credential via the client-credentials grant.
    async fn client_credentials(&self) -> Result<Credential, CredentialError>;

    /// Trades a one-time authorization code for a user credential.
    async fn authorization_code(&self, code: &str) -> Result<Credential, CredentialError>;

    /// URL the operator visits to grant user authorization.
    fn authorization_url(&self) -> String;
}
