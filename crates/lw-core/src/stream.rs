//! Live stream metadata returned by liveness queries.

use serde::{Deserialize, Serialize};

use crate::ChannelId;

/// Metadata for a channel that is currently live.
///
/// Liveness queries only return entries for live channels; absence from a
/// response means the channel is offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStream {
    pub channel_id: ChannelId,
    pub title: String,
    /// Game or category the stream is listed under
    pub category: String,
    pub viewer_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}
