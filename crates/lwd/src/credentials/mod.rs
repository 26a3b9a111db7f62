//! Credential lifecycle.
//!
//! Two credentials are managed:
//!
//! - the **service credential** (client-credentials grant), used for
//!   liveness queries and identity lookups. Obtained lazily, cached in
//!   memory, and refreshed once it expires. Concurrent callers share a
//!   single refresh.
//! - the **user credential** (authorization-code grant), required for push
//!   subscriptions. Obtained only through operator action, persisted to
//!   disk, and never refreshed automatically.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` in production code.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use lw_core::Credential;

use crate::api::TokenExchange;

mod store;

pub use store::CredentialStore;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// The token endpoint rejected or failed the grant.
    #[error("token exchange failed: {0}")]
    Exchange(String),

    /// No valid user credential; an operator must authorize at `url`.
    #[error("user authorization required: {url}")]
    AuthorizationRequired { url: String },

    /// The credential was accepted but could not be written to disk.
    #[error("failed to persist credential to {path}: {message}")]
    Persist { path: PathBuf, message: String },
}

impl CredentialError {
    pub fn authorization_url(&self) -> Option<&str> {
        match self {
            Self::AuthorizationRequired { url } => Some(url),
            _ => None,
        }
    }
}

// ============================================================================
// Credential Manager
// ============================================================================

/// Owns both credentials and hands out tokens on demand.
pub struct CredentialManager {
    exchange: Arc<dyn TokenExchange>,

    /// Held across the refresh call so only one exchange runs at a time
    service: Mutex<Option<Credential>>,

    user: RwLock<Option<Credential>>,

    store: CredentialStore,
}

impl CredentialManager {
    /// Creates a manager, loading any stored user credential.
    pub fn new(exchange: Arc<dyn TokenExchange>, store: CredentialStore) -> Self {
        let user = store.load();
        Self {
            exchange,
            service: Mutex::new(None),
            user: RwLock::new(user),
            store,
        }
    }

    /// Returns a valid service token, exchanging for a new one if needed.
    ///
    /// # Errors
    ///
    /// `CredentialError::Exchange` if no cached credential is valid and the
    /// exchange fails.
    pub async fn service_token(&self) -> Result<String, CredentialError> {
        let mut cached = self.service.lock().await;

        if let Some(credential) = cached.as_ref().filter(|c| c.is_valid()) {
            return Ok(credential.token.clone());
        }

        debug!("Service credential missing or expired, exchanging");
        let fresh = self.exchange.client_credentials().await.map_err(|e| {
            warn!(error = %e, "Service credential exchange failed");
            e
        })?;

        info!(expires_at = %fresh.expires_at, "Service credential obtained");
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    /// Returns the user token if a valid user credential is held.
    ///
    /// # Errors
    ///
    /// `CredentialError::AuthorizationRequired` (carrying the authorization
    /// URL) if the credential is missing or expired.
    pub async fn user_token(&self) -> Result<String, CredentialError> {
        let user = self.user.read().await;
        match user.as_ref().filter(|c| c.is_valid()) {
            Some(credential) => Ok(credential.token.clone()),
            None => Err(CredentialError::AuthorizationRequired {
                url: self.exchange.authorization_url(),
            }),
        }
    }

    pub async fn has_valid_user_credential(&self) -> bool {
        self.user
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.is_valid())
    }

    /// Expiry of the held user credential, valid or not.
    pub async fn user_credential_expiry(&self) -> Option<DateTime<Utc>> {
        self.user.read().await.as_ref().map(|c| c.expires_at)
    }

    /// Exchanges an authorization code for a user credential and stores it.
    ///
    /// # Errors
    ///
    /// - `CredentialError::Exchange` if the code is rejected; the previous
    ///   credential (if any) is kept
    /// - `CredentialError::Persist` if the new credential is in effect but
    ///   could not be written to disk
    pub async fn complete_authorization(&self, code: &str) -> Result<(), CredentialError> {
        let fresh = self.exchange.authorization_code(code).await?;
        info!(expires_at = %fresh.expires_at, "User authorization completed");

        let saved = self.store.save(&fresh);
        *self.user.write().await = Some(fresh);
        saved
    }

    /// Re-reads the stored user credential, picking up an authorization
    /// completed by another process. A missing file leaves the held
    /// credential untouched.
    ///
    /// Returns true if a valid user credential is held afterwards.
    pub async fn reload_user(&self) -> bool {
        if let Some(stored) = self.store.load() {
            debug!(expires_at = %stored.expires_at, "User credential reloaded");
            *self.user.write().await = Some(stored);
        }
        self.has_valid_user_credential().await
    }

    pub fn authorization_url(&self) -> String {
        self.exchange.authorization_url()
    }
}

// ============================================================================
// Tests
// ============================================================================
