//! Registry errors and events.
//!
//! - `RegistryError`: Errors that can occur during registry operations
//! - `RegistryEvent`: Events published after each committed mutation

use std::path::PathBuf;

use lw_core::{AssignmentSummary, ChannelId, Handle, Priority};
use thiserror::Error;

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
///
/// Validation and lookup failures are expected outcomes returned to the
/// caller. `Persist` means the change was applied in memory but the
/// snapshot could not be written.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A channel with this handle is already tracked.
    #[error("channel '{0}' is already tracked")]
    DuplicateHandle(Handle),

    /// The same external channel is already tracked under another handle.
    #[error("channel {channel_id} is already tracked as '{existing}'")]
    DuplicateChannel {
        channel_id: ChannelId,
        existing: Handle,
    },

    /// No channel with this handle.
    #[error("channel not found: {0}")]
    NotFound(Handle),

    /// No channel with this external id.
    #[error("no tracked channel with id {0}")]
    UnknownChannel(ChannelId),

    /// The snapshot file exists but could not be read or decoded.
    #[error("failed to load registry from {path}: {message}")]
    Load { path: PathBuf, message: String },

    /// The in-memory change was kept but writing the snapshot failed.
    #[error("failed to persist registry to {path}: {message}")]
    Persist { path: PathBuf, message: String },
}

impl RegistryError {
    /// Returns true if the operation took effect in memory and only the durable write failed.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::Persist { .. })
    }
}

// ============================================================================
// Registry Events
// ============================================================================

/// Events published by the registry after a mutation is committed in memory.
///
/// Published even when the snapshot write fails, since the in-memory state
/// (which every other component reads) did change.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added {
        channel_id: ChannelId,
        handle: Handle,
        priority: Priority,
    },

    Removed {
        channel_id: ChannelId,
        handle: Handle,
    },

    PriorityChanged {
        handle: Handle,
        priority: Priority,
    },

    LivenessChanged {
        channel_id: ChannelId,
        is_live: bool,
    },

    /// The assignment engine changed at least one delivery mode.
    ModesAssigned { summary: AssignmentSummary },
}

impl RegistryEvent {
    /// Returns true for mutations that can change which channels deserve push slots.
    pub fn affects_assignment(&self) -> bool {
        matches!(
            self,
            Self::Added { .. } | Self::Removed { .. } | Self::PriorityChanged { .. }
        )
    }
}
