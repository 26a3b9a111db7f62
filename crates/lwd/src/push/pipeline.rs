//! Push pipeline: one event session, its subscriptions, and reconnects.
//!
//! Each connection runs in its own session task. Session bookkeeping (state,
//! session id, subscription map, and the current connection's cancellation
//! token) lives in `SessionBook` behind a mutex that is never held across
//! network calls.
//!
//! Ownership of the connection is tracked by its token: whoever replaces or
//! clears the current connection cancels its token first, so a session task
//! whose token is cancelled has been superseded and exits without touching
//! the book.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` in production code.

use std::collections::{HashMap, HashSet};
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lw_core::{ChannelId, ChannelRecord, DeliveryMode};
use lw_protocol::{parse_frame, ControlMessage, EventKind, ProtocolError};

use super::state::{ErrorBackoff, ReconnectGuard, SessionState};
use super::transport::{Dialer, EventTransport, TransportError, DEFAULT_ENDPOINT};
use crate::api::{LivenessQuery, SubscriptionApi};
use crate::credentials::CredentialManager;
use crate::notify::Notifier;
use crate::registry::ChannelRegistry;

// ============================================================================
// Configuration
// ============================================================================

/// Timing and endpoint settings for the push pipeline.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub endpoint: String,
    /// Longest silence tolerated on an open connection
    pub read_deadline: Duration,
    /// Wait between tearing down a connection and redialing
    pub reconnect_cooldown: Duration,
    /// Consecutive read failures that trigger `error_cooldown`
    pub error_threshold: u32,
    pub error_cooldown: Duration,
    /// Pause between channels while subscribing
    pub subscribe_delay: Duration,
    /// Wait between failed dial attempts
    pub dial_retry_delay: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            read_deadline: Duration::from_secs(70),
            reconnect_cooldown: Duration::from_secs(2),
            error_threshold: 5,
            error_cooldown: Duration::from_secs(30),
            subscribe_delay: Duration::from_millis(100),
            dial_retry_delay: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    /// Another reconnect holds the guard.
    #[error("reconnect already in progress")]
    ReconnectInProgress,
}

/// Snapshot of the push session for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushStatus {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub subscriptions: usize,
    pub reconnecting: bool,
}

/// What an inbound event did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    WentLive,
    AlreadyLive,
    WentOffline,
    AlreadyOffline,
    UnknownChannel,
}

// ============================================================================
// Session bookkeeping
// ============================================================================

#[derive(Debug)]
struct SessionBook {
    state: SessionState,
    session_id: Option<String>,
    /// `(channel, kind) → remote subscription id`, for the current session only
    subscriptions: HashMap<(ChannelId, EventKind), String>,
    /// Cancels the current session task and closes its transport
    connection: Option<CancellationToken>,
    read_failures: ErrorBackoff,
}

impl SessionBook {
    /// Drops everything tied to the current connection and cancels it.
    fn clear_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.cancel();
        }
        self.session_id = None;
        self.subscriptions.clear();
    }

    fn is_subscribed(&self, channel_id: &ChannelId) -> bool {
        EventKind::ALL
            .iter()
            .all(|kind| self.subscriptions.contains_key(&(channel_id.clone(), *kind)))
    }

    /// Removes and returns the subscription ids held for `channel_id`.
    fn take_channel(&mut self, channel_id: &ChannelId) -> Vec<String> {
        EventKind::ALL
            .iter()
            .filter_map(|kind| self.subscriptions.remove(&(channel_id.clone(), *kind)))
            .collect()
    }
}

/// Why a session task's read loop ended.
#[derive(Debug)]
enum SessionExit {
    /// Superseded, disconnected, or shut down
    Cancelled,
    /// Welcome arrived but no user credential is available
    Unauthorized,
    ReadFailure(TransportError),
    RemoteClosed,
    Malformed(ProtocolError),
    ReconnectRequested,
}

// ============================================================================
// Push Pipeline
// ============================================================================

pub struct PushPipeline {
    registry: Arc<ChannelRegistry>,
    credentials: Arc<CredentialManager>,
    subscriptions: Arc<dyn SubscriptionApi>,
    liveness: Arc<dyn LivenessQuery>,
    notifier: Arc<dyn Notifier>,
    dialer: Arc<dyn Dialer>,
    config: PushConfig,
    book: Mutex<SessionBook>,
    reconnect_guard: ReconnectGuard,
    /// Serializes subscribe and resync passes
    resync_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl PushPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ChannelRegistry>,
        credentials: Arc<CredentialManager>,
        subscriptions: Arc<dyn SubscriptionApi>,
        liveness: Arc<dyn LivenessQuery>,
        notifier: Arc<dyn Notifier>,
        dialer: Arc<dyn Dialer>,
        config: PushConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let read_failures = ErrorBackoff::new(config.error_threshold, config.error_cooldown);
        Arc::new(Self {
            registry,
            credentials,
            subscriptions,
            liveness,
            notifier,
            dialer,
            config,
            book: Mutex::new(SessionBook {
                state: SessionState::Disconnected,
                session_id: None,
                subscriptions: HashMap::new(),
                connection: None,
                read_failures,
            }),
            reconnect_guard: ReconnectGuard::new(),
            resync_lock: Mutex::new(()),
            shutdown,
        })
    }

    pub async fn status(&self) -> PushStatus {
        let book = self.book.lock().await;
        PushStatus {
            state: book.state,
            session_id: book.session_id.clone(),
            subscriptions: book.subscriptions.len(),
            reconnecting: self.reconnect_guard.is_active(),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.book.lock().await.state
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Starts a session if push channels exist, a user credential is valid,
    /// and the pipeline is `Disconnected`. Otherwise does nothing.
    pub async fn ensure_running(self: &Arc<Self>) {
        if !self.should_run().await {
            return;
        }

        let mut book = self.book.lock().await;
        if book.state != SessionState::Disconnected {
            return;
        }
        self.start_session(&mut book);
    }

    /// Brings the session in line with the registry's current push set.
    ///
    /// - empty push set: disconnect
    /// - session with a welcome: delete stale subscriptions, add missing ones
    /// - no session: start one if possible
    pub async fn sync(self: &Arc<Self>) {
        let push = self.registry.list_by_mode(DeliveryMode::Push).await;
        if push.is_empty() {
            let state = self.state().await;
            if state != SessionState::Disconnected {
                info!("Push set empty, closing event session");
                self.disconnect().await;
            }
            return;
        }

        let (state, session_id, conn) = {
            let book = self.book.lock().await;
            (book.state, book.session_id.clone(), book.connection.clone())
        };

        match (state, session_id, conn) {
            (s, Some(session_id), Some(conn)) if s.has_session() => {
                self.resync(push, &session_id, &conn).await;
            }
            (SessionState::Disconnected, _, _) => self.ensure_running().await,
            // Connecting or reconnecting: the next welcome subscribes the current set
            _ => debug!(state = %state, "Resync deferred until session is established"),
        }
    }

    /// Closes the session deliberately and returns to `Disconnected`.
    pub async fn disconnect(&self) {
        let mut book = self.book.lock().await;
        book.clear_connection();
        book.state = SessionState::Disconnected;
        info!("Event session disconnected");
    }

    /// Tears down the current connection and dials a new one after the cooldown.
    ///
    /// # Errors
    ///
    /// `PushError::ReconnectInProgress` if another reconnect is running; the
    /// call returns immediately without waiting for it.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), PushError> {
        self.reconnect_after(self.config.reconnect_cooldown).await
    }

    /// The session is cleared before `cooldown` starts.
    async fn reconnect_after(self: &Arc<Self>, cooldown: Duration) -> Result<(), PushError> {
        let Some(_permit) = self.reconnect_guard.try_begin() else {
            debug!("Reconnect rejected, one already in progress");
            return Err(PushError::ReconnectInProgress);
        };

        {
            let mut book = self.book.lock().await;
            book.clear_connection();
            book.state = SessionState::Reconnecting;
        }
        info!(
            cooldown_ms = cooldown.as_millis() as u64,
            "Reconnecting event session"
        );

        let cancelled = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(cooldown) => false,
        };

        let should_run = !cancelled && self.should_run().await;

        let mut book = self.book.lock().await;
        // A disconnect during the cooldown wins
        if book.state == SessionState::Reconnecting {
            if should_run {
                self.start_session(&mut book);
            } else {
                book.state = SessionState::Disconnected;
                info!("Not redialing: no push channels or no user credential");
            }
        }

        Ok(())
    }

    /// Deletes the remote subscriptions held for one channel.
    pub async fn unsubscribe_channel(&self, channel_id: &ChannelId) {
        let ids = self.book.lock().await.take_channel(channel_id);
        for subscription_id in ids {
            if let Err(e) = self.subscriptions.delete_subscription(&subscription_id).await {
                warn!(channel_id = %channel_id, subscription_id = %subscription_id, error = %e, "Failed to delete subscription");
            }
        }
    }

    async fn should_run(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if self.registry.list_by_mode(DeliveryMode::Push).await.is_empty() {
            return false;
        }
        if !self.credentials.has_valid_user_credential().await {
            info!("Push channels waiting for user authorization");
            return false;
        }
        true
    }

    /// Spawns a session task for a new connection. Caller holds the book lock.
    fn start_session(self: &Arc<Self>, book: &mut SessionBook) {
        let conn = self.shutdown.child_token();
        book.connection = Some(conn.clone());
        book.session_id = None;
        book.subscriptions.clear();
        book.state = SessionState::Connecting;

        tokio::spawn(Arc::clone(self).run_session(conn));
    }

    // ------------------------------------------------------------------------
    // Session task
    // ------------------------------------------------------------------------

    async fn run_session(self: Arc<Self>, conn: CancellationToken) {
        let Some(mut transport) = self.dial(&conn).await else {
            return;
        };
        info!(endpoint = %self.config.endpoint, "Event session connected");

        let exit = self.read_loop(transport.as_mut(), &conn).await;
        transport.close().await;
        debug!(?exit, "Event session transport closed");

        match exit {
            SessionExit::Cancelled => {
                if self.shutdown.is_cancelled() {
                    self.book.lock().await.state = SessionState::Disconnected;
                }
            }
            SessionExit::Unauthorized => {
                warn!(
                    authorization_url = %self.credentials.authorization_url(),
                    "User authorization required for push subscriptions"
                );
                self.settle_disconnected(&conn).await;
            }
            SessionExit::ReadFailure(e) => {
                warn!(error = %e, "Event session read failed");
                self.reconnect_after_fault(&conn, true).await;
            }
            SessionExit::RemoteClosed => {
                warn!("Event session closed by remote");
                self.reconnect_after_fault(&conn, true).await;
            }
            SessionExit::Malformed(e) => {
                warn!(error = %e, "Malformed event frame");
                self.reconnect_after_fault(&conn, true).await;
            }
            SessionExit::ReconnectRequested => {
                self.reconnect_after_fault(&conn, false).await;
            }
        }
    }

    /// Dials until connected. Returns `None` if superseded or no longer needed.
    async fn dial(&self, conn: &CancellationToken) -> Option<Box<dyn EventTransport>> {
        loop {
            let dialed = tokio::select! {
                biased;
                _ = conn.cancelled() => return None,
                dialed = self.dialer.dial(&self.config.endpoint) => dialed,
            };

            match dialed {
                Ok(transport) => return Some(transport),
                Err(e) => {
                    warn!(endpoint = %self.config.endpoint, error = %e, "Event session dial failed");
                    if !self.should_run().await {
                        self.settle_disconnected(conn).await;
                        return None;
                    }
                    if !self
                        .sleep_unless_cancelled(self.config.dial_retry_delay, conn)
                        .await
                    {
                        return None;
                    }
                }
            }
        }
    }

    async fn read_loop(
        self: &Arc<Self>,
        transport: &mut dyn EventTransport,
        conn: &CancellationToken,
    ) -> SessionExit {
        loop {
            let frame = tokio::select! {
                biased;
                _ = conn.cancelled() => return SessionExit::Cancelled,
                frame = transport.next_frame(self.config.read_deadline) => frame,
            };

            let text = match frame {
                Ok(Some(text)) => text,
                Ok(None) => return SessionExit::RemoteClosed,
                Err(e) => return SessionExit::ReadFailure(e),
            };
            let message = match parse_frame(&text) {
                Ok(message) => message,
                Err(e) => return SessionExit::Malformed(e),
            };
            self.book.lock().await.read_failures.record_success();

            if let Some(exit) = self.handle_message(message, conn).await {
                return exit;
            }
        }
    }

    /// Handles one control message. Returns `Some` to end the read loop.
    async fn handle_message(
        self: &Arc<Self>,
        message: ControlMessage,
        conn: &CancellationToken,
    ) -> Option<SessionExit> {
        match message {
            ControlMessage::Welcome {
                session_id,
                keepalive_timeout_secs,
            } => {
                info!(session_id = %session_id, ?keepalive_timeout_secs, "Event session established");
                return self.on_welcome(session_id, conn).await;
            }
            ControlMessage::Keepalive => debug!("Keepalive"),
            ControlMessage::Notification { kind, channel_id } => {
                let outcome = self.handle_event(kind, &channel_id).await;
                debug!(kind = %kind, channel_id = %channel_id, ?outcome, "Event handled");
            }
            ControlMessage::UnhandledNotification { subscription_type } => {
                debug!(subscription_type = %subscription_type, "Ignoring notification for unknown subscription type");
            }
            ControlMessage::Reconnect { reconnect_url } => {
                info!(?reconnect_url, "Endpoint requested reconnect");
                return Some(SessionExit::ReconnectRequested);
            }
            ControlMessage::Revocation {
                subscription_id,
                channel_id,
                status,
            } => {
                warn!(subscription_id = %subscription_id, ?channel_id, ?status, "Subscription revoked");
                let mut book = self.book.lock().await;
                match channel_id {
                    Some(channel_id) => {
                        book.take_channel(&channel_id);
                    }
                    None => book.subscriptions.retain(|_, id| id != &subscription_id),
                }
            }
            ControlMessage::Unknown { message_type } => {
                debug!(message_type = %message_type, "Ignoring unknown message type");
            }
        }
        None
    }

    async fn on_welcome(
        self: &Arc<Self>,
        session_id: String,
        conn: &CancellationToken,
    ) -> Option<SessionExit> {
        {
            let mut book = self.book.lock().await;
            if conn.is_cancelled() {
                return Some(SessionExit::Cancelled);
            }
            book.session_id = Some(session_id.clone());
            book.subscriptions.clear();
            book.state = SessionState::SessionEstablished;
        }

        if !self.credentials.has_valid_user_credential().await {
            return Some(SessionExit::Unauthorized);
        }

        {
            let mut book = self.book.lock().await;
            if conn.is_cancelled() {
                return Some(SessionExit::Cancelled);
            }
            book.state = SessionState::Subscribing;
        }

        // Keep reading keepalives while subscribing
        tokio::spawn(Arc::clone(self).subscribe_all(session_id, conn.clone()));
        None
    }

    /// Reconnects unless `conn` was superseded. A `read_failure` counts
    /// toward the escalated cooldown.
    async fn reconnect_after_fault(self: &Arc<Self>, conn: &CancellationToken, read_failure: bool) {
        if conn.is_cancelled() {
            return;
        }

        let mut cooldown = self.config.reconnect_cooldown;
        if read_failure {
            if let Some(escalated) = self.book.lock().await.read_failures.record_failure() {
                warn!(
                    cooldown_secs = escalated.as_secs(),
                    "Too many consecutive read errors, backing off"
                );
                cooldown = escalated;
            }
        }

        if let Err(e) = self.reconnect_after(cooldown).await {
            debug!(error = %e, "Fault-triggered reconnect skipped");
        }
    }

    /// Returns to `Disconnected` if `conn` is still the current connection.
    async fn settle_disconnected(&self, conn: &CancellationToken) {
        let mut book = self.book.lock().await;
        if conn.is_cancelled() {
            return;
        }
        book.clear_connection();
        book.state = SessionState::Disconnected;
    }

    /// Sleeps for `duration`; returns `false` if `conn` was cancelled first.
    async fn sleep_unless_cancelled(&self, duration: Duration, conn: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = conn.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    async fn subscribe_all(self: Arc<Self>, session_id: String, conn: CancellationToken) {
        let _pass = self.resync_lock.lock().await;
        let push = self.registry.list_by_mode(DeliveryMode::Push).await;

        let mut failed = 0usize;
        for (index, record) in push.iter().enumerate() {
            if conn.is_cancelled() {
                return;
            }
            if index > 0 && !self.sleep_unless_cancelled(self.config.subscribe_delay, &conn).await {
                return;
            }
            if !self.subscribe_channel(record, &session_id, &conn).await {
                failed += 1;
            }
        }

        let mut book = self.book.lock().await;
        if conn.is_cancelled() {
            return;
        }
        if book.state == SessionState::Subscribing {
            book.state = SessionState::Active;
        }
        info!(
            channels = push.len(),
            failed,
            subscriptions = book.subscriptions.len(),
            "Event session active"
        );
    }

    /// Creates both subscriptions for one channel. Returns `false` on failure.
    async fn subscribe_channel(
        &self,
        record: &ChannelRecord,
        session_id: &str,
        conn: &CancellationToken,
    ) -> bool {
        for kind in EventKind::ALL {
            let key = (record.channel_id.clone(), kind);
            if self.book.lock().await.subscriptions.contains_key(&key) {
                continue;
            }

            match self
                .subscriptions
                .create_subscription(kind, &record.channel_id, session_id)
                .await
            {
                Ok(subscription_id) => {
                    let mut book = self.book.lock().await;
                    // Session replaced mid-call; the endpoint drops its subscriptions with it
                    if conn.is_cancelled() || book.session_id.as_deref() != Some(session_id) {
                        return false;
                    }
                    book.subscriptions.insert(key, subscription_id);
                }
                Err(e) => {
                    error!(
                        handle = %record.handle,
                        kind = %kind,
                        error = %e,
                        "Failed to subscribe channel"
                    );
                    return false;
                }
            }
        }
        true
    }

    async fn resync(&self, push: Vec<ChannelRecord>, session_id: &str, conn: &CancellationToken) {
        let _pass = self.resync_lock.lock().await;

        let wanted: HashSet<&ChannelId> = push.iter().map(|r| &r.channel_id).collect();
        let stale: Vec<(ChannelId, String)> = {
            let mut book = self.book.lock().await;
            let stale_keys: Vec<(ChannelId, EventKind)> = book
                .subscriptions
                .keys()
                .filter(|(channel_id, _)| !wanted.contains(channel_id))
                .cloned()
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|key| {
                    let id = book.subscriptions.remove(&key)?;
                    Some((key.0, id))
                })
                .collect()
        };

        for (channel_id, subscription_id) in &stale {
            if let Err(e) = self.subscriptions.delete_subscription(subscription_id).await {
                warn!(channel_id = %channel_id, subscription_id = %subscription_id, error = %e, "Failed to delete stale subscription");
            }
        }

        let mut added = 0usize;
        for record in &push {
            if conn.is_cancelled() {
                return;
            }
            if self.book.lock().await.is_subscribed(&record.channel_id) {
                continue;
            }
            if added > 0 && !self.sleep_unless_cancelled(self.config.subscribe_delay, conn).await {
                return;
            }
            if self.subscribe_channel(record, session_id, conn).await {
                added += 1;
            }
        }

        if stale.is_empty() && added == 0 {
            debug!("Push subscriptions already in sync");
        } else {
            info!(removed = stale.len(), added, "Push subscriptions resynced");
        }
    }

    // ------------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------------

    /// Applies a liveness event for `channel_id`.
    ///
    /// An online event for a channel not yet live fetches stream metadata
    /// (failure tolerated), sends one notification, then records the channel
    /// live. An offline event only records the state change.
    pub async fn handle_event(&self, kind: EventKind, channel_id: &ChannelId) -> EventOutcome {
        let Some(record) = self.registry.get_by_channel_id(channel_id).await else {
            warn!(channel_id = %channel_id, kind = %kind, "Event for untracked channel discarded");
            return EventOutcome::UnknownChannel;
        };

        match kind {
            EventKind::StreamOnline if record.is_live => EventOutcome::AlreadyLive,
            EventKind::StreamOnline => {
                info!(handle = %record.handle, "Channel went live (push)");

                let stream = match self.liveness.query_liveness(slice::from_ref(channel_id)).await {
                    Ok(streams) => streams.into_iter().find(|s| &s.channel_id == channel_id),
                    Err(e) => {
                        warn!(handle = %record.handle, error = %e, "Stream metadata unavailable");
                        None
                    }
                };

                if let Err(e) = self.notifier.notify(&record, stream.as_ref()).await {
                    error!(handle = %record.handle, error = %e, "Notification failed");
                }

                if let Err(e) = self.registry.update_liveness(channel_id, true).await {
                    warn!(handle = %record.handle, error = %e, "Failed to record live state");
                }
                EventOutcome::WentLive
            }
            EventKind::StreamOffline if !record.is_live => EventOutcome::AlreadyOffline,
            EventKind::StreamOffline => {
                info!(handle = %record.handle, "Channel went offline (push)");
                if let Err(e) = self.registry.update_liveness(channel_id, false).await {
                    warn!(handle = %record.handle, error = %e, "Failed to record offline state");
                }
                EventOutcome::WentOffline
            }
        }
    }
}
