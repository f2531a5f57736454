//! Snapshot records and the per-server snapshot table.
//!
//! # Locking
//!
//! The table itself sits behind an `RwLock` that is only held long enough
//! to look up, insert, or clone out record handles. Each record has its own
//! `Mutex`, so deliveries from different inbound links can append channel
//! state and register markers without corrupting a record. No code path
//! ever holds two record locks at once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use super::message::{InFlightMessage, ServerId, SnapshotId};
use crate::sync::{lock, read, write};

/// Captured state of one server for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub snapshot_id: SnapshotId,
    /// Token balances at the local trigger, keyed by server.
    pub tokens: BTreeMap<ServerId, u64>,
    /// Messages that were in a channel at snapshot time, in arrival order.
    pub messages: Vec<InFlightMessage>,
}

impl SnapshotState {
    /// Sum of captured balances.
    pub fn local_tokens(&self) -> u64 {
        self.tokens.values().fold(0, |acc, t| acc.saturating_add(*t))
    }

    /// Sum of token amounts recorded as channel state.
    pub fn in_flight_tokens(&self) -> u64 {
        self.messages
            .iter()
            .filter_map(|m| m.message.token_amount())
            .fold(0, u64::saturating_add)
    }

    /// Captured balances plus channel state.
    pub fn total_tokens(&self) -> u64 {
        self.local_tokens().saturating_add(self.in_flight_tokens())
    }
}

/// Lifecycle of a record. `Absent` is represented by no record at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    /// Local state captured, markers pending on at least one inbound link.
    Open,
    /// Markers received on every inbound link. The record is frozen.
    Complete,
}

/// One server's progress on one snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    state: SnapshotState,
    markers_received: BTreeSet<ServerId>,
    status: SnapshotStatus,
}

impl SnapshotRecord {
    /// Open a record holding `server`'s balance at the moment of the trigger.
    pub fn new(snapshot_id: SnapshotId, server: ServerId, tokens: u64) -> Self {
        let mut captured = BTreeMap::new();
        captured.insert(server, tokens);
        SnapshotRecord {
            state: SnapshotState {
                snapshot_id,
                tokens: captured,
                messages: Vec::new(),
            },
            markers_received: BTreeSet::new(),
            status: SnapshotStatus::Open,
        }
    }

    /// Id of the snapshot this record belongs to.
    pub fn snapshot_id(&self) -> SnapshotId {
        self.state.snapshot_id
    }

    /// Captured balance and channel state so far.
    pub fn state(&self) -> &SnapshotState {
        &self.state
    }

    /// Inbound neighbors whose marker has arrived.
    pub fn markers_received(&self) -> &BTreeSet<ServerId> {
        &self.markers_received
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SnapshotStatus {
        self.status
    }

    pub fn is_complete(&self) -> bool {
        self.status == SnapshotStatus::Complete
    }

    /// Record `message` as channel state unless its link's marker already
    /// arrived. Returns whether it was recorded.
    pub(crate) fn record_in_flight(&mut self, message: &InFlightMessage) -> bool {
        if self.is_complete() || self.markers_received.contains(&message.src) {
            return false;
        }
        self.state.messages.push(message.clone());
        true
    }

    /// Register a marker from `src`. Returns true only on the call that
    /// moves the record to `Complete`.
    pub(crate) fn record_marker(&mut self, src: ServerId, quorum: usize) -> bool {
        self.markers_received.insert(src);
        self.complete_if_covered(quorum)
    }

    /// Move to `Complete` once markers cover all `quorum` inbound links.
    /// Returns true only on the transition.
    pub(crate) fn complete_if_covered(&mut self, quorum: usize) -> bool {
        if self.status == SnapshotStatus::Open && self.markers_received.len() >= quorum {
            self.status = SnapshotStatus::Complete;
            return true;
        }
        false
    }
}

/// Shared handle to a record.
pub type SharedRecord = Arc<Mutex<SnapshotRecord>>;

/// Concurrent map from snapshot id to record.
#[derive(Debug, Default)]
pub struct SnapshotTable {
    records: RwLock<HashMap<SnapshotId, SharedRecord>>,
}

impl SnapshotTable {
    pub fn new() -> Self {
        SnapshotTable {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, snapshot_id: SnapshotId) -> Option<SharedRecord> {
        read(&self.records).get(&snapshot_id).cloned()
    }

    pub fn contains(&self, snapshot_id: SnapshotId) -> bool {
        read(&self.records).contains_key(&snapshot_id)
    }

    /// Install `record` unless one already exists for its id.
    ///
    /// Returns `Ok` with the installed handle, or `Err` with the existing
    /// one; the existing record is never replaced.
    pub fn insert_if_absent(&self, record: SnapshotRecord) -> Result<SharedRecord, SharedRecord> {
        let mut records = write(&self.records);
        let snapshot_id = record.snapshot_id();
        if let Some(existing) = records.get(&snapshot_id) {
            return Err(existing.clone());
        }
        let shared = Arc::new(Mutex::new(record));
        records.insert(snapshot_id, shared.clone());
        Ok(shared)
    }

    /// Visit every record in ascending id order, locking one at a time.
    ///
    /// Handles are cloned out first, so inserts for other ids may proceed
    /// while the traversal runs. A record inserted mid-traversal may or may
    /// not be visited.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&mut SnapshotRecord),
    {
        let mut handles: Vec<(SnapshotId, SharedRecord)> = read(&self.records)
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        for (_, record) in handles {
            f(&mut lock(&record));
        }
    }

    /// Known snapshot ids, ascending.
    pub fn ids(&self) -> Vec<SnapshotId> {
        let mut ids: Vec<SnapshotId> = read(&self.records).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Copy of one record.
    pub fn record(&self, snapshot_id: SnapshotId) -> Option<SnapshotRecord> {
        self.get(snapshot_id).map(|r| lock(&r).clone())
    }

    pub fn len(&self) -> usize {
        read(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.records).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Message;
    use std::thread;

    fn token_from(src: &str, amount: u64) -> InFlightMessage {
        InFlightMessage {
            src: src.into(),
            dest: "B".into(),
            message: Message::Token { amount },
        }
    }

    #[test]
    fn test_record_stops_recording_after_marker() {
        let mut record = SnapshotRecord::new(0, "B".into(), 5);

        assert!(record.record_in_flight(&token_from("A", 1)));
        assert!(!record.record_marker("A".into(), 2));
        assert!(!record.record_in_flight(&token_from("A", 2)));
        assert!(record.record_in_flight(&token_from("C", 3)));

        assert_eq!(record.state().in_flight_tokens(), 4);
        assert_eq!(record.state().local_tokens(), 5);
        assert_eq!(record.status(), SnapshotStatus::Open);
    }

    #[test]
    fn test_record_completes_once() {
        let mut record = SnapshotRecord::new(0, "B".into(), 0);

        assert!(!record.record_marker("A".into(), 2));
        assert!(record.record_marker("C".into(), 2));
        assert!(record.is_complete());

        // A repeated marker must not report completion again.
        assert!(!record.record_marker("C".into(), 2));
        assert!(!record.complete_if_covered(2));
    }

    #[test]
    fn test_record_with_no_inbound_links_completes_immediately() {
        let mut record = SnapshotRecord::new(3, "B".into(), 8);
        assert!(record.complete_if_covered(0));
        assert!(!record.record_in_flight(&token_from("A", 1)));
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let table = SnapshotTable::new();
        assert!(table.insert_if_absent(SnapshotRecord::new(1, "B".into(), 5)).is_ok());

        let existing = table
            .insert_if_absent(SnapshotRecord::new(1, "B".into(), 99))
            .unwrap_err();
        assert_eq!(lock(&existing).state().local_tokens(), 5);
        assert_eq!(table.len(), 1);
        assert!(table.contains(1));
        assert!(!table.contains(2));
    }

    #[test]
    fn test_for_each_visits_in_id_order() {
        let table = SnapshotTable::new();
        for id in [4, 1, 3] {
            table.insert_if_absent(SnapshotRecord::new(id, "B".into(), 0)).unwrap();
        }

        let mut seen = Vec::new();
        table.for_each(|record| seen.push(record.snapshot_id()));
        assert_eq!(seen, vec![1, 3, 4]);
        assert_eq!(table.ids(), vec![1, 3, 4]);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let table = Arc::new(SnapshotTable::new());
        table.insert_if_absent(SnapshotRecord::new(0, "B".into(), 0)).unwrap();
        table.insert_if_absent(SnapshotRecord::new(1, "B".into(), 0)).unwrap();

        let handles: Vec<_> = ["A", "C", "D", "E"]
            .into_iter()
            .map(|src| {
                let table = table.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        table.for_each(|record| {
                            record.record_in_flight(&token_from(src, 1));
                        });
                    }
                })
            })
            .collect();

        // Inserts for a different id proceed while traversals run.
        table.insert_if_absent(SnapshotRecord::new(7, "B".into(), 0)).unwrap();

        for handle in handles {
            handle.join().unwrap();
        }

        for id in [0, 1] {
            let record = table.record(id).unwrap();
            assert_eq!(record.state().messages.len(), 1000);
            assert_eq!(record.state().in_flight_tokens(), 1000);
        }
    }
}
