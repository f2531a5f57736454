//! Delivery engine and scenario errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::{ProtocolError, ServerId, SnapshotId};

/// Errors from parsing topology and event scripts.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Malformed line. `line` is 1-based.
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("topology is missing the server count")]
    MissingServerCount,

    #[error("topology declares {expected} servers but lists {found}")]
    MissingServers { expected: usize, found: usize },

    #[error("failed to read {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ScriptError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        ScriptError::Parse {
            line,
            message: message.into(),
        }
    }
}

/// Errors from driving servers through a delivery engine.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("unknown server {0}")]
    UnknownServer(ServerId),

    #[error("server {0} already exists")]
    DuplicateServer(ServerId),

    /// A fatal protocol error stopped the engine earlier.
    #[error("halted after fatal error: {0}")]
    Halted(ProtocolError),

    /// Topology changes are rejected once link workers are running.
    #[error("topology is frozen once the cluster is started")]
    AlreadyStarted,

    #[error("snapshot {snapshot_id} still incomplete after {ticks} ticks")]
    Stalled { snapshot_id: SnapshotId, ticks: u64 },

    #[error("links still busy after {ticks} ticks")]
    NotQuiet { ticks: u64 },
}

impl SimError {
    /// Whether this error stops the engine for good.
    pub fn is_fatal(&self) -> bool {
        match self {
            SimError::Protocol(err) => err.is_fatal(),
            SimError::Halted(_) => true,
            _ => false,
        }
    }
}
