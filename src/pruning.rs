//! Retention rules and destroy-list computation.
//!
//! A [`KeepRule`] marks snapshots that must survive; [`prune_snapshots`]
//! destroys exactly the snapshots no rule keeps. An empty rule list keeps
//! everything.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::pdu::FilesystemVersion;

/// A snapshot as seen by the pruning policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneSnapshot {
    pub version: FilesystemVersion,
    /// Whether the receiving side confirmed this snapshot, or has no
    /// record of it at all (treated optimistically as already
    /// replicated so that sender and receiver pruning cannot deadlock
    /// on each other).
    pub replicated: bool,
    pub date: DateTime<Utc>,
}

/// One retention rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepRule {
    /// Keep the `count` most recent snapshots by creation date.
    KeepLastN { count: usize },
    /// Keep snapshots the receiving side has not confirmed yet.
    KeepNotReplicated,
}

impl KeepRule {
    /// GUIDs of the snapshots this rule keeps.
    fn kept_guids(&self, snaps: &[PruneSnapshot]) -> HashSet<u64> {
        match self {
            KeepRule::KeepLastN { count } => {
                let mut by_age: Vec<&PruneSnapshot> = snaps.iter().collect();
                by_age.sort_by(|a, b| {
                    b.date
                        .cmp(&a.date)
                        .then(b.version.create_txg.cmp(&a.version.create_txg))
                });
                by_age
                    .into_iter()
                    .take(*count)
                    .map(|s| s.version.guid)
                    .collect()
            }
            KeepRule::KeepNotReplicated => snaps
                .iter()
                .filter(|s| !s.replicated)
                .map(|s| s.version.guid)
                .collect(),
        }
    }
}

/// Compute the destroy list: snapshots kept by no rule.
///
/// An empty rule list means keep all.
pub fn prune_snapshots(snaps: &[PruneSnapshot], rules: &[KeepRule]) -> Vec<PruneSnapshot> {
    if rules.is_empty() {
        return Vec::new();
    }
    let mut keep = HashSet::new();
    for rule in rules {
        keep.extend(rule.kept_guids(snaps));
    }
    snaps
        .iter()
        .filter(|s| !keep.contains(&s.version.guid))
        .cloned()
        .collect()
}
