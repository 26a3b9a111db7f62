//! Push session state, reconnect guard, and read-error backoff.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Lifecycle of the event session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No connection and no connection attempt.
    #[default]
    Disconnected,
    /// Dialing the endpoint, or waiting for the welcome message.
    Connecting,
    /// Welcome received; session id known.
    SessionEstablished,
    /// Creating subscriptions for the push set.
    Subscribing,
    /// All subscription attempts for the push set made.
    Active,
    /// Previous connection torn down; waiting out the cooldown before redialing.
    Reconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::SessionEstablished => "session_established",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// True once a welcome has been received on the current connection.
    pub fn has_session(&self) -> bool {
        matches!(
            self,
            Self::SessionEstablished | Self::Subscribing | Self::Active
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Reconnect Guard
// ============================================================================

/// Admits at most one reconnect at a time. A second attempt is refused
/// immediately rather than queued.
#[derive(Debug, Default)]
pub struct ReconnectGuard {
    in_progress: AtomicBool,
}

/// Held for the duration of a reconnect; releases the guard on drop.
#[derive(Debug)]
pub struct ReconnectPermit<'a> {
    guard: &'a ReconnectGuard,
}

impl ReconnectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the guard, or returns `None` if a reconnect is already running.
    pub fn try_begin(&self) -> Option<ReconnectPermit<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReconnectPermit { guard: self })
    }

    pub fn is_active(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

impl Drop for ReconnectPermit<'_> {
    fn drop(&mut self) {
        self.guard.in_progress.store(false, Ordering::Release);
    }
}

// ============================================================================
// Error Backoff
// ============================================================================

/// Counts consecutive read failures across reconnects.
///
/// Every `threshold`-th consecutive failure yields an escalated cooldown and
/// resets the count. A successful read resets it as well.
#[derive(Debug, Clone)]
pub struct ErrorBackoff {
    threshold: u32,
    cooldown: Duration,
    consecutive: u32,
}

impl ErrorBackoff {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive: 0,
        }
    }

    /// Records a failure; returns the cooldown to apply if the threshold was reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            Some(self.cooldown)
        } else {
            None
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
