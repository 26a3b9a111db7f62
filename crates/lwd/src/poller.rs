//! Pull pipeline: periodic batch liveness polling.
//!
//! Each tick reads the pull-assigned channels, queries liveness in batches of
//! [`POLL_BATCH_SIZE`], and diffs the answer against the registry:
//!
//! - not live → live: one notification, then `update_liveness(true)`
//! - live → absent: `update_liveness(false)`, no notification
//! - unchanged: nothing written
//!
//! A failed batch is logged and skipped; its channels are retried on the
//! next tick.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` in production code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lw_core::{ChannelId, ChannelRecord, DeliveryMode, LiveStream};

use crate::api::LivenessQuery;
use crate::notify::Notifier;
use crate::registry::ChannelRegistry;

/// Channels per liveness query.
pub const POLL_BATCH_SIZE: usize = 100;

/// Pause between consecutive batches within one tick.
pub const INTER_BATCH_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Liveness Diff
// ============================================================================

/// A transition detected by comparing a batch against a liveness answer.
#[derive(Debug, Clone, PartialEq)]
pub enum LivenessChange {
    WentLive {
        record: ChannelRecord,
        stream: LiveStream,
    },
    WentOffline {
        record: ChannelRecord,
    },
}

/// Compares `batch` against the set of currently live streams.
///
/// Streams for channels not in `batch` are ignored. Records whose liveness
/// did not change produce nothing.
pub fn diff_liveness(batch: &[ChannelRecord], live: &[LiveStream]) -> Vec<LivenessChange> {
    let live_by_id: HashMap<&ChannelId, &LiveStream> =
        live.iter().map(|s| (&s.channel_id, s)).collect();

    batch
        .iter()
        .filter_map(|record| match (record.is_live, live_by_id.get(&record.channel_id)) {
            (false, Some(stream)) => Some(LivenessChange::WentLive {
                record: record.clone(),
                stream: (*stream).clone(),
            }),
            (true, None) => Some(LivenessChange::WentOffline {
                record: record.clone(),
            }),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Poller
// ============================================================================

/// Outcome of one polling tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Pull channels read at the start of the tick
    pub polled: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub went_live: usize,
    pub went_offline: usize,
    /// Online transitions whose notification could not be delivered
    pub notify_failures: usize,
}

pub struct Poller {
    registry: Arc<ChannelRegistry>,
    liveness: Arc<dyn LivenessQuery>,
    notifier: Arc<dyn Notifier>,
    batch_delay: Duration,
}

impl Poller {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        liveness: Arc<dyn LivenessQuery>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            liveness,
            notifier,
            batch_delay: INTER_BATCH_DELAY,
        }
    }

    /// Overrides the pause between batches.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Runs one polling tick over every pull-assigned channel.
    pub async fn poll_once(&self) -> PollSummary {
        let records = self.registry.list_by_mode(DeliveryMode::Pull).await;
        let mut summary = PollSummary {
            polled: records.len(),
            ..PollSummary::default()
        };

        if records.is_empty() {
            debug!("No pull channels, skipping tick");
            return summary;
        }

        for (index, batch) in records.chunks(POLL_BATCH_SIZE).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }
            summary.batches += 1;

            let ids: Vec<ChannelId> = batch.iter().map(|r| r.channel_id.clone()).collect();
            let live = match self.liveness.query_liveness(&ids).await {
                Ok(live) => live,
                Err(e) => {
                    summary.failed_batches += 1;
                    warn!(batch = index, size = batch.len(), error = %e, "Liveness batch failed");
                    continue;
                }
            };

            for change in diff_liveness(batch, &live) {
                self.apply(change, &mut summary).await;
            }
        }

        summary
    }

    async fn apply(&self, change: LivenessChange, summary: &mut PollSummary) {
        match change {
            LivenessChange::WentLive { record, stream } => {
                summary.went_live += 1;
                info!(handle = %record.handle, title = %stream.title, "Channel went live (poll)");

                if let Err(e) = self.notifier.notify(&record, Some(&stream)).await {
                    summary.notify_failures += 1;
                    error!(handle = %record.handle, error = %e, "Notification failed");
                }

                if let Err(e) = self.registry.update_liveness(&record.channel_id, true).await {
                    warn!(handle = %record.handle, error = %e, "Failed to record live state");
                }
            }
            LivenessChange::WentOffline { record } => {
                summary.went_offline += 1;
                info!(handle = %record.handle, "Channel went offline (poll)");

                if let Err(e) = self.registry.update_liveness(&record.channel_id, false).await {
                    warn!(handle = %record.handle, error = %e, "Failed to record offline state");
                }
            }
        }
    }
}

/// Spawns the polling timer. The first tick fires one `period` after start.
pub fn spawn_poll_task(
    poller: Arc<Poller>,
    period: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = period.as_secs(), "Poller started");

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Poller shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let summary = poller.poll_once().await;
                    if summary.polled > 0 {
                        info!(
                            polled = summary.polled,
                            batches = summary.batches,
                            failed_batches = summary.failed_batches,
                            went_live = summary.went_live,
                            went_offline = summary.went_offline,
                            "Poll tick complete"
                        );
                    }
                }
            }
        }

        debug!("Poll task completed");
    })
}
