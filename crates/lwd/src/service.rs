//! Service coordinator.
//!
//! Entry point for operator actions (add, remove, reprioritize, check,
//! authorize) and for keeping delivery modes in line with the registry.
//! Mutations that can move push slots are picked up by the reassignment
//! task, which reruns assignment and resyncs the push pipeline.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Lookup and validation failures are returned, never logged as faults

use std::collections::HashMap;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lw_core::{
    AssignmentSummary, ChannelId, ChannelRecord, DomainError, Handle, LiveStream, Priority,
};

use crate::api::{ApiError, IdentityLookup, LivenessQuery};
use crate::credentials::{CredentialError, CredentialManager};
use crate::poller::POLL_BATCH_SIZE;
use crate::push::{PushPipeline, SessionState};
use crate::registry::{ChannelRegistry, RegistryError};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    InvalidHandle(#[from] DomainError),

    #[error("channel '{0}' is already tracked")]
    AlreadyTracked(Handle),

    #[error("channel '{0}' is not tracked")]
    NotTracked(Handle),

    #[error(transparent)]
    Registry(RegistryError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateHandle(handle) => Self::AlreadyTracked(handle),
            RegistryError::NotFound(handle) => Self::NotTracked(handle),
            other => Self::Registry(other),
        }
    }
}

impl ServiceError {
    /// The authorization URL, if this failure is waiting on operator authorization.
    pub fn authorization_url(&self) -> Option<&str> {
        match self {
            Self::Api(e) => e.authorization_url(),
            Self::Credential(e) => e.authorization_url(),
            _ => None,
        }
    }

    pub fn is_authorization_required(&self) -> bool {
        self.authorization_url().is_some()
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Liveness of one channel as seen by a manual check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Live(LiveStream),
    Offline,
    /// The channel's batch could not be queried; state was left as is.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCheck {
    pub record: ChannelRecord,
    pub outcome: CheckOutcome,
}

/// Point-in-time view of the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub tracked: usize,
    pub assignment: AssignmentSummary,
    pub push_capacity: usize,
    pub push_state: SessionState,
    pub session_id: Option<String>,
    pub subscriptions: usize,
    /// Set when no valid user credential is held.
    pub authorization_url: Option<String>,
    pub user_credential_expires_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Watch Service
// ============================================================================

pub struct WatchService {
    registry: Arc<ChannelRegistry>,
    credentials: Arc<CredentialManager>,
    identity: Arc<dyn IdentityLookup>,
    liveness: Arc<dyn LivenessQuery>,
    push: Arc<PushPipeline>,
    push_capacity: usize,
}

impl WatchService {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        credentials: Arc<CredentialManager>,
        identity: Arc<dyn IdentityLookup>,
        liveness: Arc<dyn LivenessQuery>,
        push: Arc<PushPipeline>,
        push_capacity: usize,
    ) -> Self {
        Self {
            registry,
            credentials,
            identity,
            liveness,
            push,
            push_capacity,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn push(&self) -> &Arc<PushPipeline> {
        &self.push
    }

    // ------------------------------------------------------------------------
    // Channel management
    // ------------------------------------------------------------------------

    /// Resolves `raw` to a channel and starts tracking it.
    ///
    /// The new record's liveness is set from one query without notifying, so
    /// a channel that is already live when added does not announce itself.
    /// A failed query leaves it offline.
    ///
    /// # Errors
    ///
    /// - `ServiceError::InvalidHandle` if `raw` is not a valid handle
    /// - `ServiceError::AlreadyTracked` if the handle is tracked
    /// - `ServiceError::Api` if the lookup fails or finds no channel
    /// - `ServiceError::Registry` if the channel id is tracked under another
    ///   handle, or the record was added but not persisted
    pub async fn add_channel(
        &self,
        raw: &str,
        priority: Priority,
    ) -> Result<ChannelRecord, ServiceError> {
        let handle = Handle::parse(raw)?;
        if self.registry.get(&handle).await.is_some() {
            return Err(ServiceError::AlreadyTracked(handle));
        }

        let identity = self.identity.resolve_identity(&handle).await?;
        if let Some(existing) = self.registry.get_by_channel_id(&identity.channel_id).await {
            return Err(RegistryError::DuplicateChannel {
                channel_id: identity.channel_id,
                existing: existing.handle,
            }
            .into());
        }

        let mut record = ChannelRecord::new(identity.channel_id, identity.handle, identity.display_name)
            .with_priority(priority);

        match self
            .liveness
            .query_liveness(slice::from_ref(&record.channel_id))
            .await
        {
            Ok(live) => {
                let is_live = live.iter().any(|s| s.channel_id == record.channel_id);
                record.observe(is_live, Utc::now());
            }
            Err(e) => {
                warn!(handle = %record.handle, error = %e, "Initial liveness check failed");
            }
        }

        self.registry.add(record.clone()).await?;
        info!(
            handle = %record.handle,
            channel_id = %record.channel_id,
            priority = %record.priority,
            is_live = record.is_live,
            "Channel added"
        );
        Ok(record)
    }

    /// Stops tracking a channel and deletes its push subscriptions.
    ///
    /// # Errors
    ///
    /// `ServiceError::NotTracked` for an unknown handle. A persistence
    /// failure is returned after the subscriptions are cleaned up.
    pub async fn remove_channel(&self, raw: &str) -> Result<ChannelRecord, ServiceError> {
        let handle = Handle::parse(raw)?;
        let record = self
            .registry
            .get(&handle)
            .await
            .ok_or_else(|| ServiceError::NotTracked(handle.clone()))?;

        let removed = self.registry.remove(&handle).await;
        if matches!(&removed, Err(e) if !e.is_persistence_failure()) {
            return removed.map_err(Into::into);
        }

        self.push.unsubscribe_channel(&record.channel_id).await;
        removed.map_err(Into::into)
    }

    /// Changes a channel's priority.
    ///
    /// # Errors
    ///
    /// `ServiceError::NotTracked` for an unknown handle.
    pub async fn set_priority(
        &self,
        raw: &str,
        priority: Priority,
    ) -> Result<ChannelRecord, ServiceError> {
        let handle = Handle::parse(raw)?;
        Ok(self.registry.set_priority(&handle, priority).await?)
    }

    pub async fn list(&self) -> Vec<ChannelRecord> {
        self.registry.list().await
    }

    /// Queries liveness for every tracked channel and records the answers.
    ///
    /// No notifications are sent. Results follow registry order.
    pub async fn check_all(&self) -> Vec<ChannelCheck> {
        let records = self.registry.list().await;
        let mut checks = Vec::with_capacity(records.len());

        for batch in records.chunks(POLL_BATCH_SIZE) {
            let ids: Vec<ChannelId> = batch.iter().map(|r| r.channel_id.clone()).collect();

            let live = match self.liveness.query_liveness(&ids).await {
                Ok(live) => live,
                Err(e) => {
                    warn!(size = batch.len(), error = %e, "Manual check batch failed");
                    let message = e.to_string();
                    checks.extend(batch.iter().map(|record| ChannelCheck {
                        record: record.clone(),
                        outcome: CheckOutcome::Failed(message.clone()),
                    }));
                    continue;
                }
            };

            let mut live_by_id: HashMap<ChannelId, LiveStream> = live
                .into_iter()
                .map(|s| (s.channel_id.clone(), s))
                .collect();

            for record in batch {
                let outcome = match live_by_id.remove(&record.channel_id) {
                    Some(stream) => CheckOutcome::Live(stream),
                    None => CheckOutcome::Offline,
                };
                let is_live = matches!(outcome, CheckOutcome::Live(_));

                if let Err(e) = self.registry.update_liveness(&record.channel_id, is_live).await {
                    warn!(handle = %record.handle, error = %e, "Failed to record checked liveness");
                }

                let mut record = record.clone();
                record.is_live = is_live;
                checks.push(ChannelCheck { record, outcome });
            }
        }

        checks
    }

    // ------------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------------

    /// Exchanges an authorization code, then syncs the push pipeline: a
    /// stopped pipeline is started, a live session subscribes any push
    /// channel it is missing.
    ///
    /// # Errors
    ///
    /// `ServiceError::Credential` if the code is rejected. If the credential
    /// was accepted but not persisted, the pipeline is still started and the
    /// persistence error returned.
    pub async fn complete_authorization(&self, code: &str) -> Result<(), ServiceError> {
        let result = self.credentials.complete_authorization(code).await;
        if matches!(result, Err(CredentialError::Exchange(_))) {
            return result.map_err(Into::into);
        }

        self.push.sync().await;
        result.map_err(Into::into)
    }

    /// Picks up a user credential written by another process.
    pub async fn reload_authorization(&self) -> bool {
        let valid = self.credentials.reload_user().await;
        if valid {
            self.push.sync().await;
        }
        valid
    }

    pub fn authorization_url(&self) -> String {
        self.credentials.authorization_url()
    }

    // ------------------------------------------------------------------------
    // Status / Reconciliation
    // ------------------------------------------------------------------------

    pub async fn status(&self) -> ServiceStatus {
        let records = self.registry.list().await;
        let push = self.push.status().await;
        let authorized = self.credentials.has_valid_user_credential().await;

        ServiceStatus {
            tracked: records.len(),
            assignment: AssignmentSummary::of(&records),
            push_capacity: self.push_capacity,
            push_state: push.state,
            session_id: push.session_id,
            subscriptions: push.subscriptions,
            authorization_url: (!authorized).then(|| self.credentials.authorization_url()),
            user_credential_expires_at: self.credentials.user_credential_expiry().await,
        }
    }

    /// Reruns mode assignment and brings the push pipeline in line with it.
    ///
    /// Returns whether any delivery mode changed.
    ///
    /// # Errors
    ///
    /// `ServiceError::Registry` if modes changed but were not persisted; the
    /// push pipeline is synced regardless.
    pub async fn reconcile(&self) -> Result<bool, ServiceError> {
        let assigned = self.registry.assign_modes(self.push_capacity).await;
        self.push.sync().await;
        Ok(assigned?)
    }
}

/// Spawns the task that reconciles delivery modes after registry changes.
///
/// Runs one reconciliation at start. A lagged receiver is treated as a
/// change, since the missed events may have moved push slots. Every
/// `resync_interval` the push pipeline is resynced so channels whose
/// subscriptions failed are retried.
pub fn spawn_reassignment_task(
    service: Arc<WatchService>,
    resync_interval: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut events = service.registry.subscribe();
    // A zero period would panic inside the timer
    let period = resync_interval.max(Duration::from_millis(1));
    let mut resync = tokio::time::interval_at(Instant::now() + period, period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        if let Err(e) = service.reconcile().await {
            warn!(error = %e, "Startup reconciliation failed");
        }

        loop {
            let trigger = tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Reassignment task shutting down");
                    break;
                }

                event = events.recv() => match event {
                    Ok(event) => event.affects_assignment(),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Registry events lagged, reconciling");
                        true
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = resync.tick() => {
                    service.push.sync().await;
                    false
                }
            };

            if trigger {
                if let Err(e) = service.reconcile().await {
                    warn!(error = %e, "Reconciliation failed");
                }
            }
        }

        debug!("Reassignment task completed");
    })
}
