//! Channel registry.
//!
//! The registry is the single source of truth for tracked channels. Records
//! live in memory behind a read/write lock; every mutation rewrites the
//! on-disk snapshot before returning and publishes a [`RegistryEvent`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ Service/Poller/ │────▶│ ChannelRegistry │────▶│ Broadcast Channel│
//! │  Push pipeline  │     │ RwLock<Vec<..>> │     └────────┬─────────┘
//! └─────────────────┘     └────────┬────────┘              │ RegistryEvent
//!                                  │ save()                ▼
//!                                  ▼               reassignment task
//!                           channels.json
//! ```
//!
//! Records are kept in a `Vec` in insertion order. That order is observable:
//! it is the snapshot order and the tie-break for push slot assignment.
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use lw_core::{
    assign_modes, AssignmentSummary, ChannelId, ChannelRecord, DeliveryMode, Handle, Priority,
};

mod error;
mod store;

pub use error::{RegistryError, RegistryEvent};
pub use store::SnapshotStore;

use store::dedup;

/// Event buffer size; slow subscribers see `Lagged` beyond this
const EVENT_BUFFER: usize = 100;

// ============================================================================
// Channel Registry
// ============================================================================

/// Concurrent, persisted set of tracked channels.
///
/// Readers share the lock. Mutations hold the write lock across the
/// snapshot write, so the file always reflects a serial order of changes.
pub struct ChannelRegistry {
    records: RwLock<Vec<ChannelRecord>>,
    store: SnapshotStore,
    event_publisher: broadcast::Sender<RegistryEvent>,
}

impl ChannelRegistry {
    /// Opens the registry backed by the snapshot at `path`.
    ///
    /// A missing snapshot yields an empty registry. Records repeating an
    /// earlier channel id or handle are dropped and the cleaned snapshot is
    /// written back immediately.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Load` if the snapshot exists but is unreadable.
    /// A failure to write back the deduplicated snapshot is only logged.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let store = SnapshotStore::new(path);

        let records = match store.load()? {
            Some(loaded) => {
                let (records, dropped) = dedup(loaded);
                if dropped > 0 {
                    warn!(
                        path = %store.path().display(),
                        dropped,
                        "Dropped duplicate channel records from snapshot"
                    );
                    if let Err(e) = store.save(&records) {
                        error!(error = %e, "Failed to rewrite deduplicated snapshot");
                    }
                }
                info!(channels = records.len(), "Registry loaded");
                records
            }
            None => {
                info!(path = %store.path().display(), "No registry snapshot, starting empty");
                Vec::new()
            }
        };

        let (event_publisher, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            records: RwLock::new(records),
            store,
            event_publisher,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Subscribes to events published after each committed mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_publisher.subscribe()
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Tracks a new channel.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DuplicateHandle` if the handle is already tracked
    /// - `RegistryError::DuplicateChannel` if the channel id is already tracked
    /// - `RegistryError::Persist` if the record was added but not written
    pub async fn add(&self, record: ChannelRecord) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;

        if records.iter().any(|r| r.handle == record.handle) {
            return Err(RegistryError::DuplicateHandle(record.handle));
        }

        if let Some(existing) = records.iter().find(|r| r.channel_id == record.channel_id) {
            return Err(RegistryError::DuplicateChannel {
                channel_id: record.channel_id,
                existing: existing.handle.clone(),
            });
        }

        info!(
            handle = %record.handle,
            channel_id = %record.channel_id,
            priority = %record.priority,
            "Channel added"
        );

        let event = RegistryEvent::Added {
            channel_id: record.channel_id.clone(),
            handle: record.handle.clone(),
            priority: record.priority,
        };
        records.push(record);

        self.commit(&records, event)
    }

    /// Stops tracking a channel and returns the removed record.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` if no channel has this handle
    /// - `RegistryError::Persist` if the record was removed but the snapshot not written
    pub async fn remove(&self, handle: &Handle) -> Result<ChannelRecord, RegistryError> {
        let mut records = self.records.write().await;

        let index = records
            .iter()
            .position(|r| &r.handle == handle)
            .ok_or_else(|| RegistryError::NotFound(handle.clone()))?;

        let removed = records.remove(index);
        info!(handle = %removed.handle, channel_id = %removed.channel_id, "Channel removed");

        self.commit(
            &records,
            RegistryEvent::Removed {
                channel_id: removed.channel_id.clone(),
                handle: removed.handle.clone(),
            },
        )?;

        Ok(removed)
    }

    /// Changes a channel's priority and returns the updated record.
    ///
    /// Setting the current priority again is a no-op (nothing written).
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` if no channel has this handle
    /// - `RegistryError::Persist` if the change was not written
    pub async fn set_priority(
        &self,
        handle: &Handle,
        priority: Priority,
    ) -> Result<ChannelRecord, RegistryError> {
        let mut records = self.records.write().await;

        let record = records
            .iter_mut()
            .find(|r| &r.handle == handle)
            .ok_or_else(|| RegistryError::NotFound(handle.clone()))?;

        if record.priority == priority {
            debug!(handle = %handle, priority = %priority, "Priority unchanged");
            return Ok(record.clone());
        }

        record.priority = priority;
        let updated = record.clone();
        info!(handle = %handle, priority = %priority, "Channel priority changed");

        self.commit(
            &records,
            RegistryEvent::PriorityChanged {
                handle: handle.clone(),
                priority,
            },
        )?;

        Ok(updated)
    }

    /// Records an observed liveness and refreshes `last_checked`.
    ///
    /// # Errors
    ///
    /// - `RegistryError::UnknownChannel` if no channel has this id
    /// - `RegistryError::Persist` if the change was not written
    pub async fn update_liveness(
        &self,
        channel_id: &ChannelId,
        is_live: bool,
    ) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;

        let record = records
            .iter_mut()
            .find(|r| &r.channel_id == channel_id)
            .ok_or_else(|| RegistryError::UnknownChannel(channel_id.clone()))?;

        let was_live = record.is_live;
        record.observe(is_live, Utc::now());
        debug!(handle = %record.handle, was_live, is_live, "Liveness recorded");

        if was_live == is_live {
            // Timestamp-only change; persist without announcing
            return self.persist(&records);
        }

        self.commit(
            &records,
            RegistryEvent::LivenessChanged {
                channel_id: channel_id.clone(),
                is_live,
            },
        )
    }

    /// Runs the assignment engine for `capacity` push slots under the write lock.
    ///
    /// Returns `true` if any record's mode changed; only then is the snapshot
    /// written.
    ///
    /// # Errors
    ///
    /// `RegistryError::Persist` if modes changed but were not written.
    pub async fn assign_modes(&self, capacity: usize) -> Result<bool, RegistryError> {
        let mut records = self.records.write().await;

        if !assign_modes(&mut records, capacity) {
            return Ok(false);
        }

        let summary = AssignmentSummary::of(&records);
        info!(
            capacity,
            push = summary.push,
            pull = summary.pull,
            high_overflow = summary.high_overflow,
            "Delivery modes reassigned"
        );

        self.commit(&records, RegistryEvent::ModesAssigned { summary })?;
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn get(&self, handle: &Handle) -> Option<ChannelRecord> {
        let records = self.records.read().await;
        records.iter().find(|r| &r.handle == handle).cloned()
    }

    pub async fn get_by_channel_id(&self, channel_id: &ChannelId) -> Option<ChannelRecord> {
        let records = self.records.read().await;
        records.iter().find(|r| &r.channel_id == channel_id).cloned()
    }

    /// Every record, in insertion order.
    pub async fn list(&self) -> Vec<ChannelRecord> {
        self.records.read().await.clone()
    }

    /// Records currently assigned `mode`, in insertion order.
    pub async fn list_by_mode(&self, mode: DeliveryMode) -> Vec<ChannelRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| r.delivery_mode == mode)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Publishes `event` and writes the snapshot.
    ///
    /// The event goes out first: the in-memory state changed regardless of
    /// whether the write succeeds.
    fn commit(&self, records: &[ChannelRecord], event: RegistryEvent) -> Result<(), RegistryError> {
        // No subscribers is fine
        let _ = self.event_publisher.send(event);
        self.persist(records)
    }

    fn persist(&self, records: &[ChannelRecord]) -> Result<(), RegistryError> {
        self.store.save(records).map_err(|e| {
            error!(error = %e, "Registry change kept in memory but not persisted");
            e
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
