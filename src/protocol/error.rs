//! Protocol error types.

use thiserror::Error;

use super::message::{ServerId, SnapshotId};

/// Errors raised by [`super::Server`] operations.
///
/// The precondition violations are fatal: they indicate a misconfigured
/// topology or a buggy driver, never a transient condition. A delivery
/// engine that sees one must stop driving the system.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Transfer larger than the sender's balance.
    #[error("server {server} attempted to send {requested} tokens when it only has {available}")]
    InsufficientTokens {
        server: ServerId,
        requested: u64,
        available: u64,
    },

    /// Transfer to a server that is not an outbound neighbor.
    #[error("unknown destination {dest} from server {server}")]
    UnknownDestination { server: ServerId, dest: ServerId },

    /// Local trigger for a snapshot this server already recorded.
    /// The existing record is left untouched.
    #[error("snapshot {snapshot_id} already started on server {server}")]
    DuplicateSnapshot {
        server: ServerId,
        snapshot_id: SnapshotId,
    },
}

impl ProtocolError {
    /// Whether the driving engine must halt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InsufficientTokens { .. } | ProtocolError::UnknownDestination { .. }
        )
    }
}
