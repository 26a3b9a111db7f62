//! On-disk snapshot of the channel registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use lw_core::ChannelRecord;
use tracing::debug;

use super::RegistryError;
use crate::persist::{read_json, write_json_atomic};

/// Reads and writes the registry snapshot: an ordered JSON array of records.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, returning `None` if no file exists yet.
    ///
    /// # Errors
    ///
    /// `RegistryError::Load` if the file cannot be read or decoded.
    pub fn load(&self) -> Result<Option<Vec<ChannelRecord>>, RegistryError> {
        read_json(&self.path).map_err(|e| RegistryError::Load {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Loads the snapshot for display without ever writing it back.
    ///
    /// Duplicates are dropped in memory only; the file is left to its owner.
    ///
    /// # Errors
    ///
    /// `RegistryError::Load` if the file cannot be read or decoded.
    pub fn read_only(&self) -> Result<Vec<ChannelRecord>, RegistryError> {
        Ok(self.load()?.map(|records| dedup(records).0).unwrap_or_default())
    }

    /// Overwrites the snapshot with `records`.
    ///
    /// # Errors
    ///
    /// `RegistryError::Persist` if the file cannot be written.
    pub fn save(&self, records: &[ChannelRecord]) -> Result<(), RegistryError> {
        write_json_atomic(&self.path, records).map_err(|e| RegistryError::Persist {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        debug!(path = %self.path.display(), channels = records.len(), "Registry snapshot written");
        Ok(())
    }
}

/// Drops records whose channel id or handle already appeared earlier.
///
/// Returns the surviving records (original order) and the number dropped.
pub fn dedup(records: Vec<ChannelRecord>) -> (Vec<ChannelRecord>, usize) {
    let total = records.len();
    let mut seen_ids = HashSet::new();
    let mut seen_handles = HashSet::new();

    let kept: Vec<ChannelRecord> = records
        .into_iter()
        .filter(|record| {
            let fresh_id = seen_ids.insert(record.channel_id.clone());
            let fresh_handle = fresh_id && seen_handles.insert(record.handle.clone());
            fresh_id && fresh_handle
        })
        .collect();

    let dropped = total - kept.len();
    (kept, dropped)
}
