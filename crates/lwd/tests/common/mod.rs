//! Shared fakes for the integration tests.
//!
//! Every collaborator trait in `lwd::api`, `lwd::notify`, and
//! `lwd::push` has an in-memory stand-in here that records its calls.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lw_core::{ChannelId, ChannelRecord, Credential, Handle, LiveStream, Priority};
use lw_protocol::EventKind;
use lwd::api::{ApiError, Identity, IdentityLookup, LivenessQuery, SubscriptionApi, TokenExchange};
use lwd::credentials::{CredentialError, CredentialManager, CredentialStore};
use lwd::notify::{Notifier, NotifyError};
use lwd::push::{Dialer, EventTransport, PushConfig, PushPipeline, TransportError};
use lwd::registry::ChannelRegistry;
use lwd::service::WatchService;

pub const AUTH_URL: &str = "https://auth.test/authorize";

// ============================================================================
// Helpers
// ============================================================================

/// Re-evaluates an async condition every 10ms until it holds or 3 seconds
/// pass. Evaluates to whether it held.
macro_rules! wait_until {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
        loop {
            if $cond {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

pub fn record(id: &str, handle: &str, priority: Priority) -> ChannelRecord {
    ChannelRecord::new(ChannelId::new(id), Handle::parse(handle).unwrap(), handle.to_uppercase())
        .with_priority(priority)
}

pub fn stream(id: &str) -> LiveStream {
    LiveStream {
        channel_id: ChannelId::new(id),
        title: format!("stream {id}"),
        category: "Just Chatting".to_string(),
        viewer_count: 10,
        started_at: None,
    }
}

// ============================================================================
// Liveness
// ============================================================================

#[derive(Default)]
pub struct FakeLiveness {
    live: Mutex<HashSet<ChannelId>>,
    failing: Mutex<HashSet<ChannelId>>,
    calls: Mutex<Vec<Vec<ChannelId>>>,
}

impl FakeLiveness {
    pub fn set_live(&self, id: &str, live: bool) {
        let mut set = self.live.lock().unwrap();
        if live {
            set.insert(ChannelId::new(id));
        } else {
            set.remove(&ChannelId::new(id));
        }
    }

    /// Any query including `id` fails.
    pub fn fail_for(&self, id: &str) {
        self.failing.lock().unwrap().insert(ChannelId::new(id));
    }

    pub fn calls(&self) -> Vec<Vec<ChannelId>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LivenessQuery for FakeLiveness {
    async fn query_liveness(&self, channel_ids: &[ChannelId]) -> Result<Vec<LiveStream>, ApiError> {
        self.calls.lock().unwrap().push(channel_ids.to_vec());

        let failing = self.failing.lock().unwrap();
        if channel_ids.iter().any(|id| failing.contains(id)) {
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        let live = self.live.lock().unwrap();
        Ok(channel_ids
            .iter()
            .filter(|id| live.contains(*id))
            .map(|id| stream(id.as_str()))
            .collect())
    }
}

// ============================================================================
// Identity
// ============================================================================

#[derive(Default)]
pub struct FakeIdentity {
    known: Mutex<HashMap<String, Identity>>,
}

impl FakeIdentity {
    pub fn with(self, handle: &str, id: &str) -> Self {
        self.known.lock().unwrap().insert(
            handle.to_string(),
            Identity {
                channel_id: ChannelId::new(id),
                handle: Handle::parse(handle).unwrap(),
                display_name: handle.to_uppercase(),
            },
        );
        self
    }
}

#[async_trait]
impl IdentityLookup for FakeIdentity {
    async fn resolve_identity(&self, handle: &Handle) -> Result<Identity, ApiError> {
        self.known
            .lock()
            .unwrap()
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| ApiError::NotFound(handle.clone()))
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Default)]
pub struct FakeSubscriptions {
    next: AtomicUsize,
    created: Mutex<Vec<(EventKind, ChannelId, String)>>,
    deleted: Mutex<Vec<String>>,
    failing: Mutex<HashSet<ChannelId>>,
    /// When set, creates need a valid user credential, as the real API does
    credentials: Option<Arc<CredentialManager>>,
}

impl FakeSubscriptions {
    pub fn checking(credentials: Arc<CredentialManager>) -> Self {
        Self {
            credentials: Some(credentials),
            ..Self::default()
        }
    }

    pub fn fail_for(&self, id: &str) {
        self.failing.lock().unwrap().insert(ChannelId::new(id));
    }

    pub fn recover(&self, id: &str) {
        self.failing.lock().unwrap().remove(&ChannelId::new(id));
    }

    /// `(kind, channel, session)` for every successful create.
    pub fn created(&self) -> Vec<(EventKind, ChannelId, String)> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionApi for FakeSubscriptions {
    async fn create_subscription(
        &self,
        kind: EventKind,
        channel_id: &ChannelId,
        session_id: &str,
    ) -> Result<String, ApiError> {
        if let Some(credentials) = &self.credentials {
            credentials.user_token().await?;
        }
        if self.failing.lock().unwrap().contains(channel_id) {
            return Err(ApiError::Status {
                status: 400,
                body: "bad condition".to_string(),
            });
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        self.created
            .lock()
            .unwrap()
            .push((kind, channel_id.clone(), session_id.to_string()));
        Ok(format!("sub-{n}"))
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ApiError> {
        self.deleted.lock().unwrap().push(subscription_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Notifier
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(ChannelId, Option<LiveStream>)>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(ChannelId, Option<LiveStream>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, record: &ChannelRecord, stream: Option<&LiveStream>) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((record.channel_id.clone(), stream.cloned()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected {
                status: 500,
                body: "down".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Token Exchange
// ============================================================================

pub struct FakeExchange {
    pub user_lifetime_secs: u64,
}

impl Default for FakeExchange {
    fn default() -> Self {
        Self {
            user_lifetime_secs: 3600,
        }
    }
}

#[async_trait]
impl TokenExchange for FakeExchange {
    async fn client_credentials(&self) -> Result<Credential, CredentialError> {
        Ok(Credential::expiring_in("service", 3600))
    }

    async fn authorization_code(&self, code: &str) -> Result<Credential, CredentialError> {
        if code == "bad" {
            return Err(CredentialError::Exchange("invalid code".to_string()));
        }
        Ok(Credential::expiring_in(format!("user-{code}"), self.user_lifetime_secs))
    }

    fn authorization_url(&self) -> String {
        AUTH_URL.to_string()
    }
}

// ============================================================================
// Transport
// ============================================================================

pub enum Inbound {
    Frame(String),
    Close,
    Error,
}

/// Test-side end of one dialed connection.
#[derive(Clone)]
pub struct Connection {
    frames: mpsc::UnboundedSender<Inbound>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.frames.send(Inbound::Frame(text.into()));
    }

    pub fn remote_close(&self) {
        let _ = self.frames.send(Inbound::Close);
    }

    pub fn read_error(&self) {
        let _ = self.frames.send(Inbound::Error);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeTransport {
    frames: mpsc::UnboundedReceiver<Inbound>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl EventTransport for FakeTransport {
    async fn next_frame(&mut self, deadline: Duration) -> Result<Option<String>, TransportError> {
        match tokio::time::timeout(deadline, self.frames.recv()).await {
            Err(_) => Err(TransportError::ReadTimeout(deadline)),
            Ok(Some(Inbound::Frame(text))) => Ok(Some(text)),
            Ok(Some(Inbound::Error)) => Err(TransportError::InvalidFrame),
            Ok(Some(Inbound::Close)) | Ok(None) => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeDialer {
    connections: Mutex<Vec<Connection>>,
    urls: Mutex<Vec<String>>,
}

impl FakeDialer {
    pub fn dials(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn connection(&self, index: usize) -> Connection {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn EventTransport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.connections.lock().unwrap().push(Connection {
            frames: tx,
            closed: closed.clone(),
        });
        self.urls.lock().unwrap().push(url.to_string());
        Ok(Box::new(FakeTransport { frames: rx, closed }))
    }
}

// ============================================================================
// Frames
// ============================================================================

pub fn welcome(session_id: &str) -> String {
    format!(
        r#"{{"metadata":{{"message_id":"w","message_type":"session_welcome"}},
            "payload":{{"session":{{"id":"{session_id}","status":"connected","keepalive_timeout_seconds":10}}}}}}"#
    )
}

pub fn keepalive() -> String {
    r#"{"metadata":{"message_id":"k","message_type":"session_keepalive"},"payload":{}}"#.to_string()
}

pub fn notification(kind: &str, channel_id: &str) -> String {
    format!(
        r#"{{"metadata":{{"message_id":"n","message_type":"notification","subscription_type":"{kind}"}},
            "payload":{{"subscription":{{"id":"s","type":"{kind}","condition":{{"broadcaster_user_id":"{channel_id}"}}}},
            "event":{{"broadcaster_user_id":"{channel_id}"}}}}}}"#
    )
}

pub fn reconnect_frame() -> String {
    r#"{"metadata":{"message_id":"r","message_type":"session_reconnect"},
        "payload":{"session":{"id":"old","status":"reconnecting","reconnect_url":"wss://elsewhere.test/ws"}}}"#
        .to_string()
}

pub fn revocation(subscription_id: &str, channel_id: &str) -> String {
    format!(
        r#"{{"metadata":{{"message_id":"v","message_type":"revocation"}},
            "payload":{{"subscription":{{"id":"{subscription_id}","type":"stream.online","status":"authorization_revoked",
            "condition":{{"broadcaster_user_id":"{channel_id}"}}}}}}}}"#
    )
}

// ============================================================================
// Harness
// ============================================================================

pub fn fast_push_config() -> PushConfig {
    PushConfig {
        endpoint: "wss://events.test/ws".to_string(),
        read_deadline: Duration::from_secs(2),
        reconnect_cooldown: Duration::from_millis(20),
        error_threshold: 5,
        error_cooldown: Duration::from_millis(50),
        subscribe_delay: Duration::from_millis(1),
        dial_retry_delay: Duration::from_millis(20),
    }
}

/// Fully wired daemon core over fakes and a temp directory.
pub struct Harness {
    pub registry: Arc<ChannelRegistry>,
    pub credentials: Arc<CredentialManager>,
    pub liveness: Arc<FakeLiveness>,
    pub identity: Arc<FakeIdentity>,
    pub subscriptions: Arc<FakeSubscriptions>,
    pub notifier: Arc<RecordingNotifier>,
    pub dialer: Arc<FakeDialer>,
    pub push: Arc<PushPipeline>,
    pub service: Arc<WatchService>,
    pub shutdown: CancellationToken,
}

pub struct HarnessBuilder {
    capacity: usize,
    config: PushConfig,
    identity: FakeIdentity,
    exchange: FakeExchange,
}

impl HarnessBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn push_config(mut self, config: PushConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identity(mut self, handle: &str, id: &str) -> Self {
        self.identity = self.identity.with(handle, id);
        self
    }

    pub fn user_lifetime_secs(mut self, secs: u64) -> Self {
        self.exchange.user_lifetime_secs = secs;
        self
    }

    pub fn build(self, dir: &Path) -> Harness {
        let registry = Arc::new(ChannelRegistry::open(dir.join("channels.json")).unwrap());
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(self.exchange),
            CredentialStore::new(dir.join("user_token.json")),
        ));
        let liveness = Arc::new(FakeLiveness::default());
        let identity = Arc::new(self.identity);
        let subscriptions = Arc::new(FakeSubscriptions::checking(credentials.clone()));
        let notifier = Arc::new(RecordingNotifier::default());
        let dialer = Arc::new(FakeDialer::default());
        let shutdown = CancellationToken::new();

        let push = PushPipeline::new(
            registry.clone(),
            credentials.clone(),
            subscriptions.clone(),
            liveness.clone(),
            notifier.clone(),
            dialer.clone(),
            self.config,
            shutdown.clone(),
        );

        let service = Arc::new(WatchService::new(
            registry.clone(),
            credentials.clone(),
            identity.clone(),
            liveness.clone(),
            push.clone(),
            self.capacity,
        ));

        Harness {
            registry,
            credentials,
            liveness,
            identity,
            subscriptions,
            notifier,
            dialer,
            push,
            service,
            shutdown,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            capacity: 3,
            config: fast_push_config(),
            identity: FakeIdentity::default(),
            exchange: FakeExchange::default(),
        }
    }

    pub async fn authorize(&self) {
        self.credentials.complete_authorization("good").await.unwrap();
    }

    /// Adds records directly to the registry and runs assignment.
    pub async fn track(&self, records: Vec<ChannelRecord>, capacity: usize) {
        for record in records {
            self.registry.add(record).await.unwrap();
        }
        self.registry.assign_modes(capacity).await.unwrap();
    }

    pub async fn subscriptions_held(&self) -> usize {
        self.push.status().await.subscriptions
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
