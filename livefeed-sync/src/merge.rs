//! Identity-preserving delta merge.
//!
//! Applying a delta runs two passes under the replica's write gate:
//!
//! 1. deletion pass: remove the listed entity ids from their collections;
//! 2. merge pass, per node from the top: drop invalidated keys, then for each
//!    entry replace arrays wholesale, merge nested objects into the existing
//!    record in place, and assign everything else directly.
//!
//! Shape mismatches never fail; they fall back to direct assignment.
//! Deltas must be applied in upstream order; there is no reordering or
//! conflict detection.

use chrono::Utc;
use serde_json::Value;

use crate::delta::{Delta, DeltaNode, DeltaValue};
use crate::replica::{Record, Replica, Slot};

/// What one merge did, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Entities removed by the deletion pass
    pub deleted: usize,
    /// Keys removed by invalidations
    pub invalidated: usize,
    /// Records merged into in place
    pub merged: usize,
    /// Fields assigned or replaced
    pub assigned: usize,
}

/// Fold `delta` into `replica` and stamp its last-update time. An empty
/// delta changes neither.
pub fn apply_delta(replica: &Replica, delta: &Delta) -> MergeStats {
    let mut stats = MergeStats::default();
    if delta.is_empty() {
        return stats;
    }
    replica.write(|root| {
        delete_entities(root, delta.deletions(), &mut stats);
        merge_node(root, delta.root(), &mut stats);
        replica.touch(Utc::now());
    });
    stats
}

fn delete_entities(root: &Record, deletions: &[(String, Vec<String>)], stats: &mut MergeStats) {
    for (collection, ids) in deletions {
        let Some(target) = root.record(collection) else {
            log::debug!("deletion for unknown collection {collection} ignored");
            continue;
        };
        let mut fields = target.fields_mut();
        for id in ids {
            if fields.remove(id).is_some() {
                stats.deleted += 1;
            }
        }
    }
}

fn merge_node(dst: &Record, node: &DeltaNode, stats: &mut MergeStats) {
    let mut fields = dst.fields_mut();

    for key in node.invalidations() {
        if fields.remove(key).is_some() {
            stats.invalidated += 1;
        }
    }

    for (key, value) in node.entries() {
        match value {
            DeltaValue::Sequence(items) => {
                fields.insert(key.clone(), Slot::Value(Value::Array(items.clone())));
                stats.assigned += 1;
            }
            DeltaValue::Node(child) => match fields.get(key) {
                Some(Slot::Record(existing)) => {
                    let existing = existing.clone();
                    merge_node(&existing, child, stats);
                    stats.merged += 1;
                }
                _ => {
                    let fresh = Record::new();
                    merge_node(&fresh, child, stats);
                    fields.insert(key.clone(), Slot::Record(fresh));
                    stats.assigned += 1;
                }
            },
            DeltaValue::Scalar(value) => {
                if let Some(Slot::Record(_)) = fields.get(key) {
                    log::debug!("scalar overwrites record at {key}");
                }
                fields.insert(key.clone(), Slot::Value(value.clone()));
                stats.assigned += 1;
            }
        }
    }
}
