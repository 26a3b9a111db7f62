//! Tracked channel entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{DomainError, DomainResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Stable external identifier of a channel.
///
/// Assigned by the streaming platform and never changes, even when the
/// channel is renamed. Used as the primary key for liveness matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Maximum length of a channel handle.
pub const MAX_HANDLE_LEN: usize = 25;

/// Human-readable, case-normalized lookup key for a channel.
///
/// Handles are trimmed and lowercased on construction, so two handles that
/// differ only in case or surrounding whitespace compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Parses and normalizes a handle from user input.
    ///
    /// Accepts ASCII letters, digits and underscores, up to
    /// [`MAX_HANDLE_LEN`] characters.
    ///
    /// # Errors
    ///
    /// - `DomainError::EmptyHandle` if nothing remains after trimming
    /// - `DomainError::InvalidHandle` for disallowed characters or length
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let normalized = raw.trim().trim_start_matches('@').to_lowercase();

        if normalized.is_empty() {
            return Err(DomainError::EmptyHandle);
        }

        if normalized.len() > MAX_HANDLE_LEN {
            return Err(DomainError::InvalidHandle {
                handle: normalized,
                reason: format!("longer than {MAX_HANDLE_LEN} characters"),
            });
        }

        let disallowed = normalized
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'));
        if let Some(bad) = disallowed {
            return Err(DomainError::InvalidHandle {
                reason: format!("unexpected character '{bad}'"),
                handle: normalized,
            });
        }

        Ok(Self(normalized))
    }

    /// Returns the normalized handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Handle {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Persisted handles pass through the same normalization, so a hand-edited
// file with "SomeName" still matches lookups for "somename".
impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Handle::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Priority / Delivery Mode
// ============================================================================

/// Notification priority of a channel.
///
/// High-priority channels compete for the limited push slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            other => Err(DomainError::InvalidPriority(other.to_string())),
        }
    }
}

/// How liveness transitions for a channel are observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Event subscription on the persistent push session (capacity-limited)
    Push,
    /// Periodic batch status query
    #[default]
    Pull,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            other => Err(DomainError::InvalidDeliveryMode(other.to_string())),
        }
    }
}

// ============================================================================
// Channel Record
// ============================================================================

/// One tracked external channel, as held by the registry and persisted to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Stable external id (primary key for liveness matching)
    pub channel_id: ChannelId,

    /// Normalized lookup key used by commands
    pub handle: Handle,

    /// Presentation name
    pub display_name: String,

    /// Last known liveness
    #[serde(default)]
    pub is_live: bool,

    /// When liveness was last observed
    pub last_checked: DateTime<Utc>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub delivery_mode: DeliveryMode,
}

impl ChannelRecord {
    /// Creates a new offline, normal-priority, pull-mode record.
    pub fn new(channel_id: ChannelId, handle: Handle, display_name: impl Into<String>) -> Self {
        Self {
            channel_id,
            handle,
            display_name: display_name.into(),
            is_live: false,
            last_checked: Utc::now(),
            priority: Priority::Normal,
            delivery_mode: DeliveryMode::Pull,
        }
    }

    /// Sets the priority (builder style).
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns true if the record is assigned to the push session.
    pub fn is_push(&self) -> bool {
        self.delivery_mode == DeliveryMode::Push
    }

    /// Records a liveness observation.
    pub fn observe(&mut self, is_live: bool, at: DateTime<Utc>) {
        self.is_live = is_live;
        self.last_checked = at;
    }
}
