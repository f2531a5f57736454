use std::collections::{BTreeSet, HashMap};

use log::warn;

use crate::protocol::{ServerId, SnapshotId};

/// Per-snapshot record of which servers reported completion.
///
/// A second report from the same server is kept aside as a duplicate so
/// the checker can flag it.
#[derive(Debug, Clone, Default)]
pub struct CompletionTracker {
    completed: HashMap<SnapshotId, BTreeSet<ServerId>>,
    duplicates: Vec<(ServerId, SnapshotId)>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `server` already reported `snapshot_id`.
    pub fn record(&mut self, server: ServerId, snapshot_id: SnapshotId) -> bool {
        let inserted = self
            .completed
            .entry(snapshot_id)
            .or_default()
            .insert(server.clone());
        if !inserted {
            warn!("{} reported snapshot {} complete twice", server, snapshot_id);
            self.duplicates.push((server, snapshot_id));
        }
        inserted
    }

    pub fn completed(&self, snapshot_id: SnapshotId) -> BTreeSet<ServerId> {
        self.completed.get(&snapshot_id).cloned().unwrap_or_default()
    }

    pub fn count(&self, snapshot_id: SnapshotId) -> usize {
        self.completed.get(&snapshot_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn duplicates(&self) -> &[(ServerId, SnapshotId)] {
        &self.duplicates
    }
}
