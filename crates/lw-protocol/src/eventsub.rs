//! EventSub websocket frames and subscription requests.
//!
//! Every frame on the push session shares one envelope:
//!
//! ```json
//! { "metadata": { "message_type": "...", ... }, "payload": { ... } }
//! ```
//!
//! [`parse_frame`] decodes the envelope and lifts it into a typed
//! [`ControlMessage`], so the push pipeline only ever matches on variants.

use lw_core::ChannelId;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ProtocolError;

/// Transport method used when binding a subscription to a websocket session.
pub const SESSION_TRANSPORT_METHOD: &str = "websocket";

/// Subscription version for stream online/offline events.
const STREAM_EVENT_VERSION: &str = "1";

// ============================================================================
// Event Kinds
// ============================================================================

/// Liveness events the push session subscribes to per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "stream.online")]
    StreamOnline,
    #[serde(rename = "stream.offline")]
    StreamOffline,
}

impl EventKind {
    /// Both kinds, in the order subscriptions are created.
    pub const ALL: [EventKind; 2] = [EventKind::StreamOnline, EventKind::StreamOffline];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamOnline => "stream.online",
            Self::StreamOffline => "stream.offline",
        }
    }

    /// Parses a subscription type string, returning `None` for kinds we never subscribe to.
    pub fn from_type(s: &str) -> Option<Self> {
        match s {
            "stream.online" => Some(Self::StreamOnline),
            "stream.offline" => Some(Self::StreamOffline),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Raw Envelope
// ============================================================================

/// Raw frame envelope as received on the websocket.
#[derive(Debug, Clone, Deserialize)]
pub struct EventSubFrame {
    pub metadata: FrameMetadata,
    #[serde(default)]
    pub payload: FramePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameMetadata {
    #[serde(default)]
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub message_timestamp: Option<String>,
    #[serde(default)]
    pub subscription_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FramePayload {
    #[serde(default)]
    pub session: Option<RawSession>,
    #[serde(default)]
    pub subscription: Option<RawSubscription>,
    #[serde(default)]
    pub event: Option<RawStreamEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSession {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSubscription {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub condition: RawCondition,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCondition {
    #[serde(default)]
    pub broadcaster_user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStreamEvent {
    pub broadcaster_user_id: String,
    #[serde(default)]
    pub broadcaster_user_login: Option<String>,
    #[serde(default)]
    pub broadcaster_user_name: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
}

// ============================================================================
// Typed Control Messages
// ============================================================================

/// A decoded push-session frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Session established; subscriptions must reference `session_id`
    Welcome {
        session_id: String,
        keepalive_timeout_secs: Option<u64>,
    },

    /// Periodic liveness signal from the endpoint
    Keepalive,

    /// A subscribed event fired
    Notification {
        kind: EventKind,
        channel_id: ChannelId,
    },

    /// Notification for a subscription type this client never creates
    UnhandledNotification { subscription_type: String },

    /// Endpoint asks the client to move to a new connection
    Reconnect { reconnect_url: Option<String> },

    /// Endpoint revoked a subscription
    Revocation {
        subscription_id: String,
        channel_id: Option<ChannelId>,
        status: Option<String>,
    },

    /// Any message type this client does not understand
    Unknown { message_type: String },
}

impl EventSubFrame {
    /// Lifts the raw envelope into a typed message.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MissingField` when a known message type lacks
    /// the payload section it depends on.
    pub fn into_message(self) -> Result<ControlMessage, ProtocolError> {
        let message_type = self.metadata.message_type;
        let payload = self.payload;

        let missing = |field: &'static str| ProtocolError::MissingField {
            message_type: message_type.clone(),
            field,
        };

        match message_type.as_str() {
            "session_welcome" => {
                let session = payload.session.ok_or_else(|| missing("payload.session"))?;
                Ok(ControlMessage::Welcome {
                    session_id: session.id,
                    keepalive_timeout_secs: session.keepalive_timeout_seconds,
                })
            }
            "session_keepalive" => Ok(ControlMessage::Keepalive),
            "session_reconnect" => Ok(ControlMessage::Reconnect {
                reconnect_url: payload.session.and_then(|s| s.reconnect_url),
            }),
            "notification" => {
                let subscription = payload
                    .subscription
                    .ok_or_else(|| missing("payload.subscription"))?;
                let event = payload.event.ok_or_else(|| missing("payload.event"))?;

                match EventKind::from_type(&subscription.kind) {
                    Some(kind) => Ok(ControlMessage::Notification {
                        kind,
                        channel_id: ChannelId::new(event.broadcaster_user_id),
                    }),
                    None => Ok(ControlMessage::UnhandledNotification {
                        subscription_type: subscription.kind,
                    }),
                }
            }
            "revocation" => {
                let subscription = payload
                    .subscription
                    .ok_or_else(|| missing("payload.subscription"))?;
                Ok(ControlMessage::Revocation {
                    subscription_id: subscription.id,
                    channel_id: subscription.condition.broadcaster_user_id.map(ChannelId::new),
                    status: subscription.status,
                })
            }
            _ => Ok(ControlMessage::Unknown { message_type }),
        }
    }
}

/// Parses a text frame into a typed control message.
///
/// # Errors
///
/// - `ProtocolError::Malformed` if the text is not a valid envelope
/// - `ProtocolError::MissingField` if a known message lacks its payload
pub fn parse_frame(text: &str) -> Result<ControlMessage, ProtocolError> {
    let frame: EventSubFrame = serde_json::from_str(text)?;
    frame.into_message()
}

// ============================================================================
// Subscription Requests
// ============================================================================

/// Body of a subscription creation request bound to a websocket session.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub version: &'static str,
    pub condition: RequestCondition,
    pub transport: RequestTransport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestCondition {
    pub broadcaster_user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestTransport {
    pub method: &'static str,
    pub session_id: String,
}

impl SubscriptionRequest {
    /// Creates a request for `kind` events of `channel_id`, delivered to `session_id`.
    pub fn new(kind: EventKind, channel_id: &ChannelId, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            version: STREAM_EVENT_VERSION,
            condition: RequestCondition {
                broadcaster_user_id: channel_id.as_str().to_string(),
            },
            transport: RequestTransport {
                method: SESSION_TRANSPORT_METHOD,
                session_id: session_id.into(),
            },
        }
    }
}
