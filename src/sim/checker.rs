//! Snapshot invariant checker.
//!
//! Verifies the properties a correct run must satisfy:
//! - Live conservation: balances + queued transfers == initial total
//! - Snapshot conservation: for one snapshot id, captured balances +
//!   recorded channel state, summed over every server, == initial total
//! - Completion: every server's record is complete, each reported once
//!
//! The checker reads each server's own record; it does not build a merged
//! global snapshot.

use std::sync::Arc;

use crate::protocol::{Server, ServerId, SnapshotId};

use super::script::Topology;

/// Types of invariant violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// Live tokens do not add up to the initial total.
    ValueNotConserved,
    /// A snapshot's recorded tokens do not add up to the initial total.
    SnapshotNotConserved,
    /// A server has no record for the snapshot.
    SnapshotMissing,
    /// A server's record is still waiting for markers.
    SnapshotIncomplete,
    /// A server reported completion more than once.
    DuplicateCompletion,
}

/// A single invariant violation.
#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
}

/// Statistics gathered during a check.
#[derive(Debug, Clone, Default)]
pub struct CheckStats {
    /// Servers examined.
    pub servers: usize,
    /// Sum of live balances.
    pub live_tokens: u64,
    /// Sum of transfers still queued on links.
    pub queued_tokens: u64,
    /// Sum of captured balances in snapshot records.
    pub snapshot_local_tokens: u64,
    /// Sum of transfers recorded as channel state.
    pub snapshot_in_flight_tokens: u64,
    pub expected_total: u64,
}

/// Result of a check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub stats: CheckStats,
}

impl CheckResult {
    fn new(violations: Vec<Violation>, stats: CheckStats) -> Self {
        CheckResult {
            passed: violations.is_empty(),
            violations,
            stats,
        }
    }

    /// Whether a violation of `kind` was found.
    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }
}

/// Verifies token invariants against a fixed expected total.
pub struct Checker {
    expected_total: u64,
}

impl Checker {
    /// Create a checker expecting `expected_total` tokens.
    pub fn new(expected_total: u64) -> Self {
        Checker { expected_total }
    }

    /// Create a checker expecting a topology's initial total.
    pub fn for_topology(topology: &Topology) -> Self {
        Checker::new(topology.total_tokens())
    }

    pub fn expected_total(&self) -> u64 {
        self.expected_total
    }

    /// Balances plus queued transfers must equal the initial total.
    pub fn verify_live(&self, servers: &[Arc<Server>]) -> CheckResult {
        let mut stats = self.stats(servers.len());
        for server in servers {
            stats.live_tokens = stats.live_tokens.saturating_add(server.tokens());
            stats.queued_tokens = stats.queued_tokens.saturating_add(server.queued_tokens());
        }

        let mut violations = Vec::new();
        let actual = stats.live_tokens.saturating_add(stats.queued_tokens);
        if actual != self.expected_total {
            violations.push(Violation {
                kind: ViolationKind::ValueNotConserved,
                description: format!(
                    "Value not conserved: balances={}, queued={}, expected={}, actual={}",
                    stats.live_tokens, stats.queued_tokens, self.expected_total, actual
                ),
            });
        }
        CheckResult::new(violations, stats)
    }

    /// Every server must hold a complete record for `snapshot_id`, and the
    /// records must account for exactly the initial total.
    pub fn verify_snapshot(&self, snapshot_id: SnapshotId, servers: &[Arc<Server>]) -> CheckResult {
        let mut stats = self.stats(servers.len());
        let mut violations = Vec::new();

        for server in servers {
            let Some(record) = server.snapshot_record(snapshot_id) else {
                violations.push(Violation {
                    kind: ViolationKind::SnapshotMissing,
                    description: format!("{} has no record for snapshot {}", server.id(), snapshot_id),
                });
                continue;
            };
            if !record.is_complete() {
                let missing: Vec<String> = server
                    .inbound_neighbors()
                    .into_iter()
                    .filter(|n| !record.markers_received().contains(n))
                    .map(|n| n.to_string())
                    .collect();
                violations.push(Violation {
                    kind: ViolationKind::SnapshotIncomplete,
                    description: format!(
                        "{} snapshot {} still waiting for markers from [{}]",
                        server.id(),
                        snapshot_id,
                        missing.join(", ")
                    ),
                });
            }
            stats.snapshot_local_tokens =
                stats.snapshot_local_tokens.saturating_add(record.state().local_tokens());
            stats.snapshot_in_flight_tokens =
                stats.snapshot_in_flight_tokens.saturating_add(record.state().in_flight_tokens());
        }

        let recorded = stats
            .snapshot_local_tokens
            .saturating_add(stats.snapshot_in_flight_tokens);
        if recorded != self.expected_total {
            violations.push(Violation {
                kind: ViolationKind::SnapshotNotConserved,
                description: format!(
                    "Snapshot {} not conserved: local={}, in_flight={}, expected={}, actual={}",
                    snapshot_id,
                    stats.snapshot_local_tokens,
                    stats.snapshot_in_flight_tokens,
                    self.expected_total,
                    recorded
                ),
            });
        }
        CheckResult::new(violations, stats)
    }

    /// No server may report a snapshot complete twice.
    pub fn verify_completions(&self, duplicates: &[(ServerId, SnapshotId)]) -> CheckResult {
        let violations = duplicates
            .iter()
            .map(|(server, snapshot_id)| Violation {
                kind: ViolationKind::DuplicateCompletion,
                description: format!("{} reported snapshot {} complete more than once", server, snapshot_id),
            })
            .collect();
        CheckResult::new(violations, self.stats(0))
    }

    fn stats(&self, servers: usize) -> CheckStats {
        CheckStats {
            servers,
            expected_total: self.expected_total,
            ..CheckStats::default()
        }
    }
}
