use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a snapshot, unique across the whole system.
pub type SnapshotId = u64;

/// Stable identifier of a server.
///
/// Ordering is lexicographic; outbound broadcasts and simulator delivery
/// walk servers and links in this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        ServerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        ServerId(id.to_string())
    }
}

impl From<String> for ServerId {
    fn from(id: String) -> Self {
        ServerId(id)
    }
}

impl Borrow<str> for ServerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Messages exchanged between servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Moves `amount` tokens from the sender's balance to the receiver's.
    Token {
        amount: u64,
    },

    /// Separates pre-snapshot from post-snapshot traffic on the link it
    /// travels. Carries nothing but the snapshot it belongs to.
    Marker {
        snapshot_id: SnapshotId,
    },
}

impl Message {
    /// Token amount carried by this message, if it is a transfer.
    pub fn token_amount(&self) -> Option<u64> {
        match self {
            Message::Token { amount } => Some(*amount),
            Message::Marker { .. } => None,
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, Message::Marker { .. })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Token { amount } => write!(f, "token({})", amount),
            Message::Marker { snapshot_id } => write!(f, "marker({})", snapshot_id),
        }
    }
}

/// A message queued on a link, waiting for its receive time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageEvent {
    pub src: ServerId,
    pub dest: ServerId,
    pub message: Message,
    /// Earliest time the delivery engine may hand this to `dest`.
    pub receive_time: u64,
}

/// A message recorded as channel state in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightMessage {
    pub src: ServerId,
    pub dest: ServerId,
    pub message: Message,
}

impl fmt::Display for InFlightMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.src, self.dest, self.message)
    }
}

/// Diagnostic events reported through [`super::Delivery::record_event`].
///
/// Purely observational: nothing recorded here feeds back into protocol state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoggedEvent {
    Sent {
        src: ServerId,
        dest: ServerId,
        message: Message,
    },
    Received {
        src: ServerId,
        dest: ServerId,
        message: Message,
    },
    SnapshotStarted {
        server: ServerId,
        snapshot_id: SnapshotId,
    },
    SnapshotCompleted {
        server: ServerId,
        snapshot_id: SnapshotId,
    },
}

impl fmt::Display for LoggedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggedEvent::Sent { src, dest, message } => match message {
                Message::Token { amount } => write!(f, "{} sent {} tokens to {}", src, amount, dest),
                Message::Marker { .. } => write!(f, "{} sent {} to {}", src, message, dest),
            },
            LoggedEvent::Received { src, dest, message } => match message {
                Message::Token { amount } => {
                    write!(f, "{} received {} tokens from {}", dest, amount, src)
                }
                Message::Marker { .. } => write!(f, "{} received {} from {}", dest, message, src),
            },
            LoggedEvent::SnapshotStarted { server, snapshot_id } => {
                write!(f, "{} startSnapshot({})", server, snapshot_id)
            }
            LoggedEvent::SnapshotCompleted { server, snapshot_id } => {
                write!(f, "{} endSnapshot({})", server, snapshot_id)
            }
        }
    }
}
