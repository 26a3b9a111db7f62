//! Push/pull mode assignment.
//!
//! Push slots are scarce: the event session accepts only a small number of
//! channels. The assignment engine partitions records so that:
//!
//! - at most `capacity` records are `Push`;
//! - `High` records take push slots first, in the order the records are
//!   given (registry insertion order);
//! - `Normal` records are always `Pull`, even when slots are left over.
//!
//! The engine is pure: it only rewrites `delivery_mode` on the slice it is
//! handed and reports whether anything changed, so the caller can decide
//! whether the push session needs to resubscribe.

use tracing::debug;

use crate::{ChannelRecord, DeliveryMode, Priority};

/// Counts describing an assignment, used for logging and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssignmentSummary {
    pub push: usize,
    pub pull: usize,
    /// High-priority records left on pull because capacity ran out
    pub high_overflow: usize,
}

impl AssignmentSummary {
    /// Summarizes the current modes of `records`.
    pub fn of(records: &[ChannelRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            match record.delivery_mode {
                DeliveryMode::Push => summary.push += 1,
                DeliveryMode::Pull => {
                    summary.pull += 1;
                    if record.priority == Priority::High {
                        summary.high_overflow += 1;
                    }
                }
            }
        }
        summary
    }
}

/// Returns true if the current modes violate the assignment rules.
///
/// The assignment is acceptable when:
/// - push count does not exceed capacity, and
/// - no normal-priority record holds a push slot, and
/// - no high-priority record is on pull while a slot is free.
pub fn needs_reassignment(records: &[ChannelRecord], capacity: usize) -> bool {
    let mut push_count = 0usize;
    let mut normal_on_push = false;
    let mut high_on_pull = false;

    for record in records {
        match (record.priority, record.delivery_mode) {
            (Priority::High, DeliveryMode::Push) => push_count += 1,
            (Priority::Normal, DeliveryMode::Push) => {
                push_count += 1;
                normal_on_push = true;
            }
            (Priority::High, DeliveryMode::Pull) => high_on_pull = true,
            (Priority::Normal, DeliveryMode::Pull) => {}
        }
    }

    push_count > capacity || normal_on_push || (high_on_pull && push_count < capacity)
}

/// Assigns delivery modes in place and returns true if any record changed.
///
/// Short-circuits without touching the records when the current assignment
/// already satisfies the rules, so repeated calls do not cause needless
/// resubscription churn.
pub fn assign_modes(records: &mut [ChannelRecord], capacity: usize) -> bool {
    if !needs_reassignment(records, capacity) {
        return false;
    }

    let previous: Vec<DeliveryMode> = records.iter().map(|r| r.delivery_mode).collect();

    for record in records.iter_mut() {
        record.delivery_mode = DeliveryMode::Pull;
    }

    let mut slots = capacity;
    for record in records.iter_mut() {
        if slots == 0 {
            break;
        }
        if record.priority == Priority::High {
            record.delivery_mode = DeliveryMode::Push;
            slots -= 1;
        }
    }

    let changed = records
        .iter()
        .zip(previous)
        .any(|(record, before)| record.delivery_mode != before);

    debug!(
        capacity,
        changed,
        summary = ?AssignmentSummary::of(records),
        "Delivery modes reassigned"
    );

    changed
}
