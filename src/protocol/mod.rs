//! Chandy-Lamport snapshot protocol.
//!
//! Servers are connected by unidirectional FIFO links and move tokens
//! between each other. Any server may trigger a snapshot; markers then
//! flood the topology and every server records its own balance plus the
//! transfers that were in its inbound channels at the cut.
//!
//! # Invariants
//!
//! 1. **Per-link FIFO**: a link delivers in send order. The marker is a
//!    clean boundary only because of this.
//! 2. **Conservation**: balances plus queued transfers always equal the
//!    initial total, and so does every completed snapshot.
//! 3. **Channel boundary**: a transfer is recorded for link `L` iff it was
//!    delivered after the local trigger and before `L`'s marker.
//! 4. **Exactly-once completion**: each server reports each snapshot once,
//!    when markers have arrived on all of its inbound links.

pub mod delivery;
pub mod error;
pub mod link;
pub mod message;
pub mod server;
pub mod snapshot;


pub use delivery::Delivery;
pub use error::ProtocolError;
pub use link::Link;
pub use message::{InFlightMessage, LoggedEvent, Message, SendMessageEvent, ServerId, SnapshotId};
pub use server::Server;
pub use snapshot::{SharedRecord, SnapshotRecord, SnapshotState, SnapshotStatus, SnapshotTable};
